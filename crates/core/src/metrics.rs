/*
 * SPDX-FileCopyrightText: 2024 DBVault Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Run and sweep counters

use crate::manager::{BackupRun, RunOutcome};
use crate::retention::SweepOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counters for the orchestrator's lifetime within one process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultMetrics {
    pub backups: BackupStats,
    pub sweeps: SweepStats,
}

/// Backup run statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupStats {
    pub total_runs: u64,
    pub successful: u64,
    pub failed: u64,
    pub skipped: u64,
    pub bytes_backed_up: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Retention sweep statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepStats {
    pub total_sweeps: u64,
    pub artifacts_deleted: u64,
    pub failed_deletions: u64,
    pub last_sweep: Option<DateTime<Utc>>,
}

impl VaultMetrics {
    pub fn new() -> Self {
        Self {
            backups: BackupStats::default(),
            sweeps: SweepStats::default(),
        }
    }

    /// Record one finished backup run
    pub fn record_run(&mut self, run: &BackupRun) {
        self.backups.total_runs += 1;
        match run.outcome {
            RunOutcome::Success => {
                self.backups.successful += 1;
                self.backups.last_success = Some(run.finished_at);
                if let Some(artifact) = &run.artifact {
                    self.backups.bytes_backed_up += artifact.size_bytes;
                }
            }
            RunOutcome::Failed => {
                self.backups.failed += 1;
                self.backups.last_failure = Some(run.finished_at);
            }
            RunOutcome::Skipped => self.backups.skipped += 1,
        }
    }

    /// Record one class sweep
    pub fn record_sweep(&mut self, outcome: &SweepOutcome) {
        self.sweeps.total_sweeps += 1;
        self.sweeps.artifacts_deleted += outcome.deleted as u64;
        self.sweeps.failed_deletions += outcome.failed as u64;
        self.sweeps.last_sweep = Some(Utc::now());
    }
}

impl Default for VaultMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for BackupStats {
    fn default() -> Self {
        Self {
            total_runs: 0,
            successful: 0,
            failed: 0,
            skipped: 0,
            bytes_backed_up: 0,
            last_success: None,
            last_failure: None,
        }
    }
}

impl Default for SweepStats {
    fn default() -> Self {
        Self {
            total_sweeps: 0,
            artifacts_deleted: 0,
            failed_deletions: 0,
            last_sweep: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{BackupArtifact, BackupClass};
    use crate::error::BackupError;

    fn run(outcome: RunOutcome, size: u64) -> BackupRun {
        let now = Utc::now();
        BackupRun {
            class: BackupClass::Daily,
            started_at: now,
            finished_at: now,
            staging_path: None,
            outcome,
            error: match outcome {
                RunOutcome::Failed => Some(BackupError::storage("disk full")),
                _ => None,
            },
            artifact: match outcome {
                RunOutcome::Success => Some(BackupArtifact {
                    class: BackupClass::Daily,
                    created_at: now,
                    path: "/backups/daily/a.sql.gz".into(),
                    digest_path: "/backups/daily/a.sql.gz.sha256".into(),
                    size_bytes: size,
                    digest: "abc".to_string(),
                }),
                _ => None,
            },
        }
    }

    #[test]
    fn test_record_run_counters() {
        let mut metrics = VaultMetrics::new();
        metrics.record_run(&run(RunOutcome::Success, 100));
        metrics.record_run(&run(RunOutcome::Success, 50));
        metrics.record_run(&run(RunOutcome::Failed, 0));
        metrics.record_run(&run(RunOutcome::Skipped, 0));

        assert_eq!(metrics.backups.total_runs, 4);
        assert_eq!(metrics.backups.successful, 2);
        assert_eq!(metrics.backups.failed, 1);
        assert_eq!(metrics.backups.skipped, 1);
        assert_eq!(metrics.backups.bytes_backed_up, 150);
        assert!(metrics.backups.last_success.is_some());
        assert!(metrics.backups.last_failure.is_some());
    }

    #[test]
    fn test_record_sweep_counters() {
        let mut metrics = VaultMetrics::new();
        metrics.record_sweep(&SweepOutcome {
            examined: 5,
            deleted: 2,
            failed: 1,
        });
        assert_eq!(metrics.sweeps.total_sweeps, 1);
        assert_eq!(metrics.sweeps.artifacts_deleted, 2);
        assert_eq!(metrics.sweeps.failed_deletions, 1);
        assert!(metrics.sweeps.last_sweep.is_some());
    }
}
