/*
 * SPDX-FileCopyrightText: 2024 DBVault Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Daemon scheduling loop
//!
//! One fire table drives the daemon: a cron schedule and a next-fire time
//! per operation. Next-fire times are computed from the wall clock, so a
//! process started mid-cycle picks up the correct upcoming slot, and an
//! operation that outlives its interval reschedules to the next *future*
//! slot instead of building a backlog (the per-class run lock drops the
//! overlapping fire).

use crate::artifact::BackupClass;
use crate::error::{BackupError, Result};
use crate::VaultService;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// One schedulable operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Backup(BackupClass),
    RetentionSweep,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Backup(class) => write!(f, "{class} backup"),
            Operation::RetentionSweep => f.write_str("retention sweep"),
        }
    }
}

/// Fire-table entry: when an operation runs next
#[derive(Debug)]
struct ScheduledOp {
    operation: Operation,
    schedule: Schedule,
    next_run: DateTime<Utc>,
}

impl ScheduledOp {
    fn new(operation: Operation, expression: &str, now: &DateTime<Utc>) -> Result<Self> {
        let schedule = Schedule::from_str(expression).map_err(|e| {
            BackupError::configuration(format!(
                "invalid schedule {expression:?} for {operation}: {e}"
            ))
        })?;
        let next_run = schedule.after(now).next().ok_or_else(|| {
            BackupError::configuration(format!(
                "schedule {expression:?} for {operation} never fires"
            ))
        })?;
        Ok(Self {
            operation,
            schedule,
            next_run,
        })
    }

    /// Advance to the next slot strictly after `now`
    fn reschedule(&mut self, now: &DateTime<Utc>) {
        match self.schedule.after(now).next() {
            Some(next) => self.next_run = next,
            None => {
                warn!(operation = %self.operation, "schedule exhausted; operation disabled");
                self.next_run = DateTime::<Utc>::MAX_UTC;
            }
        }
    }
}

/// Runs the fire table until a shutdown signal arrives
#[derive(Debug)]
pub struct Scheduler {
    service: Arc<VaultService>,
    ops: Vec<ScheduledOp>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(service: Arc<VaultService>, shutdown: watch::Receiver<bool>) -> Result<Self> {
        let schedule = &service.config().schedule;
        let now = Utc::now();
        let mut ops = Vec::with_capacity(BackupClass::ALL.len() + 1);
        for class in BackupClass::ALL {
            ops.push(ScheduledOp::new(
                Operation::Backup(class),
                schedule.backup_expression(class),
                &now,
            )?);
        }
        ops.push(ScheduledOp::new(
            Operation::RetentionSweep,
            &schedule.retention_sweep,
            &now,
        )?);
        Ok(Self {
            service,
            ops,
            shutdown,
        })
    }

    /// Run until the shutdown signal flips
    ///
    /// Each due operation is dispatched onto its own worker so a slow dump
    /// never blocks the other classes. On shutdown the loop stops
    /// dispatching and drains in-flight work to its next safe checkpoint;
    /// nothing is cancelled mid-commit.
    pub async fn run(mut self) -> Result<()> {
        for op in &self.ops {
            info!(operation = %op.operation, due_at = %op.next_run, "scheduled");
        }
        info!(operations = self.ops.len(), "backup scheduler started");

        let mut workers: JoinSet<()> = JoinSet::new();
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let Some(next) = self.ops.iter().map(|op| op.next_run).min() else {
                break;
            };
            let wait = (next - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            debug!(due_at = %next, "sleeping until next scheduled operation");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let now = Utc::now();
            for op in self.ops.iter_mut() {
                if op.next_run > now {
                    continue;
                }
                info!(operation = %op.operation, "dispatching scheduled operation");
                let service = Arc::clone(&self.service);
                let operation = op.operation;
                workers.spawn(async move {
                    service.execute_operation(operation).await;
                });
                op.reschedule(&now);
            }

            while let Some(result) = workers.try_join_next() {
                if let Err(err) = result {
                    error!(error = %err, "scheduled operation panicked");
                }
            }
        }

        info!(in_flight = workers.len(), "shutdown requested; draining in-flight operations");
        while let Some(result) = workers.join_next().await {
            if let Err(err) = result {
                error!(error = %err, "scheduled operation panicked");
            }
        }
        info!("backup scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_fire_table_uses_wall_clock_not_start_time() {
        // Started mid-cycle at 10:00 on Saturday 2024-03-09.
        let now = at(2024, 3, 9, 10, 0);

        let daily =
            ScheduledOp::new(Operation::Backup(BackupClass::Daily), "0 0 0 * * *", &now).unwrap();
        assert_eq!(daily.next_run, at(2024, 3, 10, 0, 0));

        let weekly = ScheduledOp::new(
            Operation::Backup(BackupClass::Weekly),
            "0 0 1 * * Sun",
            &now,
        )
        .unwrap();
        assert_eq!(weekly.next_run, at(2024, 3, 10, 1, 0));

        let monthly = ScheduledOp::new(
            Operation::Backup(BackupClass::Monthly),
            "0 0 2 1 * *",
            &now,
        )
        .unwrap();
        assert_eq!(monthly.next_run, at(2024, 4, 1, 2, 0));
    }

    #[test]
    fn test_reschedule_skips_missed_slots() {
        let now = at(2024, 3, 9, 10, 0);
        let mut op =
            ScheduledOp::new(Operation::RetentionSweep, "0 0 3 * * *", &now).unwrap();
        assert_eq!(op.next_run, at(2024, 3, 10, 3, 0));

        // The operation ran long: three daily slots went by while it was
        // executing. The next fire is in the future, not a backlog.
        let after_long_run = at(2024, 3, 13, 7, 30);
        op.reschedule(&after_long_run);
        assert_eq!(op.next_run, at(2024, 3, 14, 3, 0));
    }

    #[test]
    fn test_reschedule_is_strictly_future() {
        let exactly_on_slot = at(2024, 3, 10, 3, 0);
        let mut op =
            ScheduledOp::new(Operation::RetentionSweep, "0 0 3 * * *", &exactly_on_slot).unwrap();
        assert_eq!(op.next_run, at(2024, 3, 11, 3, 0));

        op.reschedule(&at(2024, 3, 11, 3, 0));
        assert_eq!(op.next_run, at(2024, 3, 12, 3, 0));
    }

    #[test]
    fn test_invalid_expression_is_a_configuration_error() {
        let now = Utc::now();
        let err = ScheduledOp::new(Operation::RetentionSweep, "yearly-ish", &now).unwrap_err();
        assert!(err.is_fatal());
    }
}
