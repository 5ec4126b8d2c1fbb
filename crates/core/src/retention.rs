/*
 * SPDX-FileCopyrightText: 2024 DBVault Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Retention sweeps
//!
//! Keeps the N most recent artifacts per class and deletes the rest, each as
//! an artifact + sidecar unit. The sweep is the only component that deletes
//! from the final tree, and it only ever touches artifacts strictly older
//! than the newest one kept, so it cannot race the commit rename.

use crate::artifact::{self, BackupClass, DIGEST_SUFFIX};
use crate::config::VaultConfig;
use crate::error::{BackupError, Result};
use crate::notify::{NotificationEvent, NotificationTrigger};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of one class sweep
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepOutcome {
    pub examined: usize,
    pub deleted: usize,
    /// Deletions that failed and were left for the next pass.
    pub failed: usize,
}

/// Enforces per-class retention policies
#[derive(Debug)]
pub struct RetentionManager {
    config: Arc<VaultConfig>,
    trigger: Arc<NotificationTrigger>,
}

impl RetentionManager {
    pub fn new(config: Arc<VaultConfig>, trigger: Arc<NotificationTrigger>) -> Self {
        Self { config, trigger }
    }

    /// Sweep one class: keep the configured number of most recent artifacts,
    /// delete the remainder
    ///
    /// A failure to delete an artifact file leaves its pair intact for the
    /// next pass; the sweep itself continues. Orphaned digest sidecars are
    /// removed as well.
    pub async fn enforce(&self, class: BackupClass) -> Result<SweepOutcome> {
        let keep = self.config.retention.keep(class);
        let dir = self.config.storage.root.join(class.subdir());
        if !dir.exists() {
            return Ok(SweepOutcome::default());
        }

        let artifacts = artifact::scan_class_dir(&dir, class).await?;
        let mut outcome = SweepOutcome {
            examined: artifacts.len(),
            ..SweepOutcome::default()
        };

        for doomed in artifacts.iter().skip(keep) {
            // Artifact first: if this fails the pair stays whole, and a
            // half-deleted pair is never a valid-looking artifact.
            match tokio::fs::remove_file(&doomed.path).await {
                Ok(()) => {
                    outcome.deleted += 1;
                    info!(
                        class = %class,
                        path = %doomed.path.display(),
                        created_at = %doomed.created_at,
                        "deleted expired artifact"
                    );
                    if let Err(e) = tokio::fs::remove_file(&doomed.digest_path).await {
                        warn!(
                            path = %doomed.digest_path.display(),
                            error = %e,
                            "failed to delete digest sidecar; it will be swept as an orphan"
                        );
                    }
                }
                Err(e) => {
                    outcome.failed += 1;
                    warn!(
                        class = %class,
                        path = %doomed.path.display(),
                        error = %e,
                        "failed to delete expired artifact; leaving it for the next sweep"
                    );
                }
            }
        }

        self.sweep_orphaned_sidecars(&dir).await;

        info!(
            class = %class,
            examined = outcome.examined,
            deleted = outcome.deleted,
            failed = outcome.failed,
            keep,
            "retention sweep finished"
        );
        Ok(outcome)
    }

    /// Sweep every class, containing failures to the class they occur in
    ///
    /// A class whose sweep errors out produces a failure notification and a
    /// log entry; the remaining classes are still swept.
    pub async fn enforce_all(&self) -> Vec<(BackupClass, SweepOutcome)> {
        let mut outcomes = Vec::with_capacity(BackupClass::ALL.len());
        for class in BackupClass::ALL {
            match self.enforce(class).await {
                Ok(outcome) => outcomes.push((class, outcome)),
                Err(err) => {
                    warn!(class = %class, error = %err, "retention sweep failed for class");
                    let event =
                        NotificationEvent::sweep_failure(&format!("{class} sweep: {err}"));
                    if let Err(notify_err) = self.trigger.dispatch(&event).await {
                        warn!(error = %notify_err, "sweep failure notification was not delivered");
                    }
                    outcomes.push((class, SweepOutcome::default()));
                }
            }
        }
        outcomes
    }

    /// Remove digest sidecars whose artifact is gone
    async fn sweep_orphaned_sidecars(&self, dir: &Path) {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "failed to scan for orphaned sidecars");
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = name.strip_suffix(DIGEST_SUFFIX) else {
                continue;
            };
            if dir.join(stem).exists() {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!(path = %path.display(), "removed orphaned digest sidecar"),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to remove orphaned digest sidecar")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{artifact_file_name, digest_path};
    use crate::config::{DatabaseConfig, RetentionConfig, StorageConfig};
    use crate::notify::{LogSink, NotificationSink};
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn retention_manager(root: &Path, retention: RetentionConfig) -> RetentionManager {
        let config = Arc::new(VaultConfig {
            database: DatabaseConfig {
                database: "shop".to_string(),
                ..DatabaseConfig::default()
            },
            storage: StorageConfig {
                root: root.to_path_buf(),
            },
            retention,
            ..VaultConfig::default()
        });
        let trigger = Arc::new(NotificationTrigger::new(
            Arc::new(LogSink) as Arc<dyn NotificationSink>,
            &config.notification,
        ));
        RetentionManager::new(config, trigger)
    }

    fn seed_artifact(root: &Path, class: BackupClass, day: u32) -> PathBuf {
        let dir = root.join(class.subdir());
        std::fs::create_dir_all(&dir).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 6, day, 0, 0, 0).unwrap();
        let path = dir.join(artifact_file_name("shop", class, at));
        std::fs::write(&path, format!("dump for day {day}")).unwrap();
        std::fs::write(digest_path(&path), "0badc0de\n").unwrap();
        path
    }

    #[tokio::test]
    async fn test_keeps_the_three_most_recent() {
        let root = TempDir::new().unwrap();
        let paths: Vec<_> = (1..=5)
            .map(|day| seed_artifact(root.path(), BackupClass::Daily, day))
            .collect();

        let manager = retention_manager(
            root.path(),
            RetentionConfig {
                daily: 3,
                ..RetentionConfig::default()
            },
        );
        let outcome = manager.enforce(BackupClass::Daily).await.unwrap();
        assert_eq!(outcome.examined, 5);
        assert_eq!(outcome.deleted, 2);
        assert_eq!(outcome.failed, 0);

        // Days 3, 4, 5 survive; days 1 and 2 are gone with their sidecars.
        for (day, path) in (1..=5).zip(&paths) {
            let expected = day >= 3;
            assert_eq!(path.exists(), expected, "artifact for day {day}");
            assert_eq!(digest_path(path).exists(), expected, "sidecar for day {day}");
        }
    }

    #[tokio::test]
    async fn test_under_quota_deletes_nothing() {
        let root = TempDir::new().unwrap();
        for day in 1..=2 {
            seed_artifact(root.path(), BackupClass::Weekly, day);
        }

        let manager = retention_manager(root.path(), RetentionConfig::default());
        let outcome = manager.enforce(BackupClass::Weekly).await.unwrap();
        assert_eq!(outcome.examined, 2);
        assert_eq!(outcome.deleted, 0);
    }

    #[tokio::test]
    async fn test_missing_class_directory_is_empty_sweep() {
        let root = TempDir::new().unwrap();
        let manager = retention_manager(root.path(), RetentionConfig::default());
        let outcome = manager.enforce(BackupClass::Monthly).await.unwrap();
        assert_eq!(outcome.examined, 0);
        assert_eq!(outcome.deleted, 0);
    }

    #[tokio::test]
    async fn test_orphaned_sidecar_is_removed() {
        let root = TempDir::new().unwrap();
        let kept = seed_artifact(root.path(), BackupClass::Daily, 1);
        let orphan = root
            .path()
            .join("daily")
            .join("shop_daily_20240502_000000.sql.gz.sha256");
        std::fs::write(&orphan, "deadbeef\n").unwrap();

        let manager = retention_manager(root.path(), RetentionConfig::default());
        manager.enforce(BackupClass::Daily).await.unwrap();

        assert!(kept.exists());
        assert!(digest_path(&kept).exists());
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn test_enforce_all_covers_every_class() {
        let root = TempDir::new().unwrap();
        for class in BackupClass::ALL {
            for day in 1..=4 {
                seed_artifact(root.path(), class, day);
            }
        }
        let manager = retention_manager(
            root.path(),
            RetentionConfig {
                daily: 1,
                weekly: 2,
                monthly: 3,
            },
        );

        let outcomes = manager.enforce_all().await;
        let deleted: usize = outcomes.iter().map(|(_, o)| o.deleted).sum();
        assert_eq!(deleted, 3 + 2 + 1);
    }
}
