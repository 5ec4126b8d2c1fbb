/*
 * SPDX-FileCopyrightText: 2024 DBVault Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Backup run orchestration
//!
//! One run walks Staging → Verifying → Committing → Notifying. The artifact
//! becomes visible at its final path through a single rename, and the
//! staging directory (which lives under the backup root, so the rename never
//! crosses filesystems) is removed on every exit path. Runs of the same
//! class are mutually exclusive; an overlapping request is skipped, never
//! queued.

use crate::artifact::{artifact_file_name, digest_path, BackupArtifact, BackupClass, TIMESTAMP_FORMAT};
use crate::config::VaultConfig;
use crate::dump::DumpExecutor;
use crate::error::{BackupError, Result};
use crate::integrity::IntegrityVerifier;
use crate::notify::{NotificationEvent, NotificationTrigger};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Staging area under the storage root, private to in-flight runs
pub const STAGING_DIR: &str = ".staging";

/// Outcome of one backup run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failed,
    /// Rejected because a run of the same class was already active.
    Skipped,
}

/// Ephemeral record of one execution attempt; never persisted beyond logs
#[derive(Debug)]
pub struct BackupRun {
    pub class: BackupClass,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Where this run staged its dump; the directory is gone by the time
    /// the run record exists.
    pub staging_path: Option<PathBuf>,
    pub outcome: RunOutcome,
    pub error: Option<BackupError>,
    pub artifact: Option<BackupArtifact>,
}

impl BackupRun {
    fn skipped(class: BackupClass) -> Self {
        let now = Utc::now();
        Self {
            class,
            started_at: now,
            finished_at: now,
            staging_path: None,
            outcome: RunOutcome::Skipped,
            error: None,
            artifact: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::Success
    }

    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Orchestrates backup runs end-to-end and owns the atomicity contract
#[derive(Debug)]
pub struct BackupManager {
    config: Arc<VaultConfig>,
    executor: Arc<dyn DumpExecutor>,
    verifier: IntegrityVerifier,
    trigger: Arc<NotificationTrigger>,
    /// One lock per class, indexed by `BackupClass as usize`.
    locks: [Mutex<()>; 3],
}

impl BackupManager {
    pub fn new(
        config: Arc<VaultConfig>,
        executor: Arc<dyn DumpExecutor>,
        trigger: Arc<NotificationTrigger>,
    ) -> Self {
        let verifier = IntegrityVerifier::new(config.limits.verify_size_ceiling);
        Self {
            config,
            executor,
            verifier,
            trigger,
            locks: [Mutex::new(()), Mutex::new(()), Mutex::new(())],
        }
    }

    /// Run one backup of `class` to completion
    ///
    /// Never returns an error: failures are contained in the returned run
    /// record, already notified and logged. An overlapping request for the
    /// same class comes back as `Skipped`.
    pub async fn run_backup(&self, class: BackupClass) -> BackupRun {
        let Ok(_guard) = self.locks[class as usize].try_lock() else {
            warn!(class = %class, "backup already running for this class; skipping overlapping request");
            return BackupRun::skipped(class);
        };

        let started_at = Utc::now();
        info!(class = %class, "starting backup run");

        let mut staging_path = None;
        let result = self.execute(class, started_at, &mut staging_path).await;
        let finished_at = Utc::now();
        let run = match result {
            Ok(artifact) => {
                info!(
                    class = %class,
                    path = %artifact.path.display(),
                    size_bytes = artifact.size_bytes,
                    digest = %artifact.digest,
                    "backup run committed"
                );
                BackupRun {
                    class,
                    started_at,
                    finished_at,
                    staging_path,
                    outcome: RunOutcome::Success,
                    error: None,
                    artifact: Some(artifact),
                }
            }
            Err(err) => {
                error!(class = %class, category = err.category(), error = %err, "backup run failed");
                BackupRun {
                    class,
                    started_at,
                    finished_at,
                    staging_path,
                    outcome: RunOutcome::Failed,
                    error: Some(err),
                    artifact: None,
                }
            }
        };

        self.notify(&run).await;
        run
    }

    /// Staging, verifying and committing; staging is cleaned up on every
    /// path out of this function
    async fn execute(
        &self,
        class: BackupClass,
        started_at: DateTime<Utc>,
        staging_path: &mut Option<PathBuf>,
    ) -> Result<BackupArtifact> {
        let root = &self.config.storage.root;
        let staging_root = root.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging_root).await.map_err(|e| {
            BackupError::storage(format!(
                "failed to create staging area {}: {e}",
                staging_root.display()
            ))
        })?;
        let staging = tempfile::Builder::new()
            .prefix(&format!(
                "{}_{}.",
                class.as_str(),
                started_at.format(TIMESTAMP_FORMAT)
            ))
            .tempdir_in(&staging_root)
            .map_err(|e| BackupError::storage(format!("failed to create staging directory: {e}")))?;
        *staging_path = Some(staging.path().to_path_buf());

        // Staging
        let file_name = artifact_file_name(&self.config.database.database, class, started_at);
        let staged = staging.path().join(&file_name);
        let payload_bytes = self.executor.dump_to(&staged).await?;
        if payload_bytes == 0 {
            return Err(BackupError::integrity_unreadable(
                "dump produced an empty artifact",
            ));
        }

        // Verifying
        let digest = self.verifier.compute_digest(&staged).await?;
        self.verifier.write_digest_file(&staged, &digest).await?;
        let recorded = self.verifier.read_digest_file(&staged).await?;
        if recorded != digest {
            return Err(BackupError::integrity_mismatch(format!(
                "digest sidecar for {} does not match the computed digest",
                staged.display()
            )));
        }
        let size_bytes = tokio::fs::metadata(&staged)
            .await
            .map_err(|e| BackupError::storage(format!("failed to stat {}: {e}", staged.display())))?
            .len();

        // Committing: artifact first, then sidecar. A failed sidecar rename
        // rolls the artifact back so nothing half-committed stays visible.
        let class_dir = root.join(class.subdir());
        tokio::fs::create_dir_all(&class_dir).await.map_err(|e| {
            BackupError::storage(format!(
                "failed to create class directory {}: {e}",
                class_dir.display()
            ))
        })?;
        let final_path = class_dir.join(&file_name);
        let final_digest_path = digest_path(&final_path);
        tokio::fs::rename(&staged, &final_path).await.map_err(|e| {
            BackupError::storage(format!(
                "failed to commit artifact {}: {e}",
                final_path.display()
            ))
        })?;
        if let Err(e) = tokio::fs::rename(digest_path(&staged), &final_digest_path).await {
            if let Err(rollback) = tokio::fs::remove_file(&final_path).await {
                error!(
                    path = %final_path.display(),
                    error = %rollback,
                    "failed to remove partially committed artifact"
                );
            }
            return Err(BackupError::storage(format!(
                "failed to commit digest sidecar {}: {e}",
                final_digest_path.display()
            )));
        }

        Ok(BackupArtifact {
            class,
            created_at: started_at,
            path: final_path,
            digest_path: final_digest_path,
            size_bytes,
            digest,
        })
    }

    /// Notifying: always runs for started runs; delivery failures are logged
    /// and never folded into the backup's outcome
    async fn notify(&self, run: &BackupRun) {
        let event = match (run.outcome, &run.artifact, &run.error) {
            (RunOutcome::Success, Some(artifact), _) => NotificationEvent::backup_success(
                run.class,
                run.duration_secs(),
                artifact.size_bytes,
                &artifact.digest,
                &artifact.path,
            ),
            (RunOutcome::Failed, _, Some(error)) => {
                NotificationEvent::backup_failure(run.class, error)
            }
            _ => return,
        };
        if let Err(err) = self.trigger.dispatch(&event).await {
            warn!(
                class = %run.class,
                error = %err,
                "notification delivery failed; backup outcome is unaffected"
            );
        }
    }

    /// Remove leftovers from runs that died mid-flight
    ///
    /// Assumes exclusive ownership of the backup root; called at service
    /// startup, before any run is active. Entries that cannot be removed are
    /// logged and left for the next start.
    pub async fn sweep_stale_staging(&self) -> Result<usize> {
        let staging_root = self.config.storage.root.join(STAGING_DIR);
        let mut entries = match tokio::fs::read_dir(&staging_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(BackupError::storage(format!(
                    "failed to list staging area {}: {e}",
                    staging_root.display()
                )))
            }
        };

        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            BackupError::storage(format!(
                "failed to list staging area {}: {e}",
                staging_root.display()
            ))
        })? {
            let path = entry.path();
            let result = match entry.file_type().await {
                Ok(kind) if kind.is_dir() => tokio::fs::remove_dir_all(&path).await,
                Ok(_) => tokio::fs::remove_file(&path).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    warn!(path = %path.display(), "removed stale staging entry");
                    removed += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to remove stale staging entry");
                }
            }
        }
        Ok(removed)
    }
}
