/*
 * SPDX-FileCopyrightText: 2024 DBVault Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Error types for backup orchestration

use thiserror::Error;

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Sub-reason carried by integrity failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityReason {
    /// The recomputed digest does not match the expected digest
    Mismatch,
    /// The artifact or its digest sidecar could not be read
    Unreadable,
}

impl std::fmt::Display for IntegrityReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityReason::Mismatch => f.write_str("mismatch"),
            IntegrityReason::Unreadable => f.write_str("unreadable"),
        }
    }
}

/// Backup orchestration errors
///
/// Every failure in the pipeline is classified into one of these kinds; the
/// kind decides how far the failure propagates. Only `Configuration` is fatal
/// to the process, and only at startup. The rest abort at most the run (or,
/// for `Storage` during a sweep, a single artifact deletion), and
/// `Notification` is never allowed to change a backup's outcome.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("backup process failed: {message}")]
    Process { message: String, stderr: String },

    #[error("integrity error ({reason}): {message}")]
    Integrity {
        reason: IntegrityReason,
        message: String,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("notification error: {0}")]
    Notification(String),
}

impl BackupError {
    /// Create a new configuration error
    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new process error carrying captured stderr
    pub fn process<T: Into<String>>(msg: T, stderr: String) -> Self {
        Self::Process {
            message: msg.into(),
            stderr,
        }
    }

    /// Create a new integrity error with the mismatch sub-reason
    pub fn integrity_mismatch<T: Into<String>>(msg: T) -> Self {
        Self::Integrity {
            reason: IntegrityReason::Mismatch,
            message: msg.into(),
        }
    }

    /// Create a new integrity error with the unreadable sub-reason
    pub fn integrity_unreadable<T: Into<String>>(msg: T) -> Self {
        Self::Integrity {
            reason: IntegrityReason::Unreadable,
            message: msg.into(),
        }
    }

    /// Create a new storage error
    pub fn storage<T: Into<String>>(msg: T) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new notification error
    pub fn notification<T: Into<String>>(msg: T) -> Self {
        Self::Notification(msg.into())
    }

    /// Get error category for logs and metrics
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Process { .. } => "process",
            Self::Integrity { .. } => "integrity",
            Self::Storage(_) => "storage",
            Self::Notification(_) => "notification",
        }
    }

    /// Whether the error terminates the process rather than a single run
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Captured subprocess stderr, when the failure came from the dump tool
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Process { stderr, .. } if !stderr.is_empty() => Some(stderr),
            _ => None,
        }
    }
}
