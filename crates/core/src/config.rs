/*
 * SPDX-FileCopyrightText: 2024 DBVault Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Configuration for the backup orchestrator
//!
//! The core treats configuration as a validated, read-only struct. Parsing a
//! configuration file into [`VaultConfig`] is the caller's job (the CLI loads
//! TOML); [`VaultConfig::validate`] is the gate every entry point runs before
//! touching the database or the storage tree.

use crate::artifact::BackupClass;
use crate::dump::validate_dump_flags;
use crate::error::{BackupError, Result};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Main configuration for the backup orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub schedule: ScheduleConfig,
    pub notification: NotificationConfig,
    pub limits: LimitsConfig,
}

/// Connection parameters handed to the dump tool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    /// Opaque extra flags passed through to the dump tool. Checked for shell
    /// metacharacters, never interpreted.
    pub dump_flags: Vec<String>,
}

/// Storage layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the backup tree; class subdirectories and the staging area
    /// live under it so commit renames stay on one filesystem.
    pub root: PathBuf,
}

/// Per-class keep-counts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub daily: usize,
    pub weekly: usize,
    pub monthly: usize,
}

impl RetentionConfig {
    /// Number of most-recent artifacts to keep for a class
    pub fn keep(&self, class: BackupClass) -> usize {
        match class {
            BackupClass::Daily => self.daily,
            BackupClass::Weekly => self.weekly,
            BackupClass::Monthly => self.monthly,
        }
    }
}

/// Cron expressions for the daemon's fire table
///
/// Seconds-resolution cron syntax (`sec min hour dom month dow`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub daily: String,
    pub weekly: String,
    pub monthly: String,
    pub retention_sweep: String,
}

impl ScheduleConfig {
    /// Cron expression for one backup class
    pub fn backup_expression(&self, class: BackupClass) -> &str {
        match class {
            BackupClass::Daily => &self.daily,
            BackupClass::Weekly => &self.weekly,
            BackupClass::Monthly => &self.monthly,
        }
    }
}

/// Notification sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub smtp: Option<SmtpConfig>,
    /// Log file whose tail is attached to failure notifications, when set.
    pub attach_log: Option<PathBuf>,
    /// Upper bound on attachment size in bytes.
    pub max_attachment_bytes: u64,
}

/// TLS mode for the SMTP sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTls {
    None,
    Starttls,
    Implicit,
}

/// SMTP endpoint and credentials for the email sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default = "default_smtp_tls")]
    pub tls: SmtpTls,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub sender: String,
    pub recipients: Vec<String>,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_tls() -> SmtpTls {
    SmtpTls::Starttls
}

/// Operational limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum dump duration before the subprocess is killed.
    pub dump_timeout_secs: u64,
    /// Artifacts at or under this size are always re-hashed during
    /// verification; only larger ones may fail fast on a size mismatch.
    pub verify_size_ceiling: u64,
}

impl VaultConfig {
    /// Validate the configuration
    ///
    /// Runs once at startup; any error here is fatal and never retried.
    pub fn validate(&self) -> Result<()> {
        if self.database.database.is_empty() {
            return Err(BackupError::configuration("database name must not be empty"));
        }
        if self.database.user.is_empty() {
            return Err(BackupError::configuration("database user must not be empty"));
        }
        if self.database.host.is_empty() {
            return Err(BackupError::configuration("database host must not be empty"));
        }
        validate_dump_flags(&self.database.dump_flags)?;

        if self.storage.root.as_os_str().is_empty() {
            return Err(BackupError::configuration("storage root must not be empty"));
        }

        for class in BackupClass::ALL {
            if self.retention.keep(class) == 0 {
                return Err(BackupError::configuration(format!(
                    "retention count for {class} backups must be at least 1"
                )));
            }
            let expression = self.schedule.backup_expression(class);
            Schedule::from_str(expression).map_err(|e| {
                BackupError::configuration(format!(
                    "invalid {class} schedule {expression:?}: {e}"
                ))
            })?;
        }
        Schedule::from_str(&self.schedule.retention_sweep).map_err(|e| {
            BackupError::configuration(format!(
                "invalid retention sweep schedule {:?}: {e}",
                self.schedule.retention_sweep
            ))
        })?;

        if self.limits.dump_timeout_secs == 0 {
            return Err(BackupError::configuration("dump timeout must be at least 1 second"));
        }

        if self.notification.enabled {
            let smtp = self.notification.smtp.as_ref().ok_or_else(|| {
                BackupError::configuration("notifications enabled but [notification.smtp] is missing")
            })?;
            if smtp.host.is_empty() {
                return Err(BackupError::configuration("smtp host must not be empty"));
            }
            if smtp.sender.is_empty() {
                return Err(BackupError::configuration("smtp sender must not be empty"));
            }
            if smtp.recipients.is_empty() {
                return Err(BackupError::configuration("smtp recipients must not be empty"));
            }
        }

        Ok(())
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            retention: RetentionConfig::default(),
            schedule: ScheduleConfig::default(),
            notification: NotificationConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "backup".to_string(),
            password: None,
            database: String::new(),
            dump_flags: vec!["--single-transaction".to_string(), "--quick".to_string()],
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: "/var/lib/dbvault/backups".into(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            daily: 7,
            weekly: 4,
            monthly: 12,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        // Daily at midnight, weekly Sunday 01:00, monthly on the 1st at
        // 02:00, sweep daily at 03:00.
        Self {
            daily: "0 0 0 * * *".to_string(),
            weekly: "0 0 1 * * Sun".to_string(),
            monthly: "0 0 2 1 * *".to_string(),
            retention_sweep: "0 0 3 * * *".to_string(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp: None,
            attach_log: None,
            max_attachment_bytes: 64 * 1024,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            dump_timeout_secs: 3600,
            verify_size_ceiling: 1024 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> VaultConfig {
        VaultConfig {
            database: DatabaseConfig {
                database: "shop".to_string(),
                ..DatabaseConfig::default()
            },
            ..VaultConfig::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_empty_database_rejected() {
        let config = VaultConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.category(), "configuration");
    }

    #[test]
    fn test_zero_retention_rejected() {
        let mut config = valid_config();
        config.retention.weekly = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_cron_rejected() {
        let mut config = valid_config();
        config.schedule.monthly = "every other tuesday".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shell_metacharacters_in_flags_rejected() {
        let mut config = valid_config();
        config.database.dump_flags.push("--result-file=x; rm -rf /".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_notification_enabled_requires_smtp() {
        let mut config = valid_config();
        config.notification.enabled = true;
        assert!(config.validate().is_err());

        config.notification.smtp = Some(SmtpConfig {
            host: "mail.example.com".to_string(),
            port: 587,
            tls: SmtpTls::Starttls,
            username: None,
            password: None,
            sender: "backup@example.com".to_string(),
            recipients: vec!["ops@example.com".to_string()],
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = valid_config();
        config.limits.dump_timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
