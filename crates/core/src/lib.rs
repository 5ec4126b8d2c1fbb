/*
 * SPDX-FileCopyrightText: 2024 DBVault Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! # DBVault Core
//!
//! Automated database backup orchestration:
//!
//! - Scheduled daily/weekly/monthly dumps via an external dump tool
//! - Atomic staging → verify → commit pipeline (artifacts are never visible
//!   half-written)
//! - SHA-256 integrity verification with digest sidecars
//! - Per-class retention sweeps
//! - Best-effort success/failure notifications
//!
//! The dump tool is an opaque subprocess and the notification transport is a
//! trait; neither is assumed beyond its contract.

pub mod artifact;
pub mod config;
pub mod dump;
pub mod error;
pub mod integrity;
pub mod manager;
pub mod metrics;
pub mod notify;
pub mod retention;
pub mod scheduler;

pub use artifact::{BackupArtifact, BackupClass};
pub use config::VaultConfig;
pub use dump::{DumpExecutor, MysqldumpExecutor};
pub use error::{BackupError, IntegrityReason, Result};
pub use integrity::IntegrityVerifier;
pub use manager::{BackupManager, BackupRun, RunOutcome};
pub use metrics::VaultMetrics;
#[cfg(feature = "email")]
pub use notify::SmtpSink;
pub use notify::{LogSink, NotificationEvent, NotificationSink, NotificationTrigger};
pub use retention::{RetentionManager, SweepOutcome};
pub use scheduler::{Operation, Scheduler};

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Main backup orchestration service
///
/// Owns the manager, the retention sweeper, the notification trigger and the
/// run counters. One instance is shared by the CLI entry points and the
/// daemon scheduler.
#[derive(Debug)]
pub struct VaultService {
    config: Arc<VaultConfig>,
    manager: BackupManager,
    retention: RetentionManager,
    trigger: Arc<NotificationTrigger>,
    metrics: Arc<RwLock<VaultMetrics>>,
}

impl VaultService {
    /// Create the service with the default `mysqldump` executor
    pub async fn new(config: VaultConfig, sink: Arc<dyn NotificationSink>) -> Result<Self> {
        let executor = Arc::new(MysqldumpExecutor::new(&config)?);
        Self::with_executor(config, executor, sink).await
    }

    /// Create the service with a caller-provided dump executor
    ///
    /// Validates the configuration (the only fatal error class) and sweeps
    /// staging leftovers from a previous process before any run starts.
    pub async fn with_executor(
        config: VaultConfig,
        executor: Arc<dyn DumpExecutor>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        info!(storage_root = %config.storage.root.display(), "initializing backup orchestrator");

        tokio::fs::create_dir_all(&config.storage.root)
            .await
            .map_err(|e| {
                BackupError::storage(format!(
                    "failed to create storage root {}: {e}",
                    config.storage.root.display()
                ))
            })?;

        let trigger = Arc::new(NotificationTrigger::new(sink, &config.notification));
        let manager = BackupManager::new(
            Arc::clone(&config),
            executor,
            Arc::clone(&trigger),
        );
        match manager.sweep_stale_staging().await {
            Ok(0) => {}
            Ok(removed) => warn!(removed, "cleaned up stale staging entries from a previous run"),
            Err(err) => warn!(error = %err, "failed to sweep stale staging area"),
        }
        let retention = RetentionManager::new(Arc::clone(&config), Arc::clone(&trigger));

        Ok(Self {
            config,
            manager,
            retention,
            trigger,
            metrics: Arc::new(RwLock::new(VaultMetrics::new())),
        })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Run one backup of `class`; failures are contained in the returned run
    pub async fn run_backup(&self, class: BackupClass) -> BackupRun {
        let run = self.manager.run_backup(class).await;
        self.metrics.write().await.record_run(&run);
        run
    }

    /// Run one backup of every class, in schedule order
    pub async fn run_all(&self) -> Vec<BackupRun> {
        let mut runs = Vec::with_capacity(BackupClass::ALL.len());
        for class in BackupClass::ALL {
            runs.push(self.run_backup(class).await);
        }
        runs
    }

    /// Run one retention sweep per class
    pub async fn cleanup(&self) -> Vec<(BackupClass, SweepOutcome)> {
        let outcomes = self.retention.enforce_all().await;
        let mut metrics = self.metrics.write().await;
        for (_, outcome) in &outcomes {
            metrics.record_sweep(outcome);
        }
        outcomes
    }

    /// Send one synthetic event through the configured sink
    pub async fn test_notification(&self) -> Result<()> {
        self.trigger.dispatch(&NotificationEvent::test()).await
    }

    /// Snapshot of the run counters
    pub async fn metrics(&self) -> VaultMetrics {
        self.metrics.read().await.clone()
    }

    /// Entry point for the scheduler's workers; never propagates errors
    pub async fn execute_operation(&self, operation: Operation) {
        match operation {
            Operation::Backup(class) => {
                self.run_backup(class).await;
            }
            Operation::RetentionSweep => {
                self.cleanup().await;
            }
        }
    }
}
