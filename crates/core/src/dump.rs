/*
 * SPDX-FileCopyrightText: 2024 DBVault Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Dump subprocess execution
//!
//! The dump tool is an opaque collaborator: it reads connection parameters
//! and writes a byte stream. This module owns spawning it, compressing its
//! output into the staging area, and classifying its failures. It never
//! retries; the next scheduled cadence is the retry.

use crate::config::{DatabaseConfig, VaultConfig};
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Characters that would let a flag escape into a shell. The subprocess is
/// spawned without a shell, but flags are opaque config input and rejected
/// up front anyway.
const SHELL_METACHARACTERS: &[char] =
    &[';', '|', '&', '$', '`', '>', '<', '(', ')', '\n', '\r'];

/// Upper bound on captured stderr
const STDERR_CAPTURE_LIMIT: u64 = 16 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// Reject dump flags containing shell metacharacters
///
/// Injection check only; flags are never interpreted.
pub fn validate_dump_flags(flags: &[String]) -> Result<()> {
    for flag in flags {
        if flag.contains(SHELL_METACHARACTERS) {
            return Err(BackupError::configuration(format!(
                "dump flag {flag:?} contains shell metacharacters"
            )));
        }
    }
    Ok(())
}

/// Executes one dump of the configured database into a staging file
#[async_trait]
pub trait DumpExecutor: Send + Sync + std::fmt::Debug {
    /// Run the dump tool, streaming its output into `dest`.
    ///
    /// Returns the number of payload bytes read from the tool (before
    /// compression). Any non-zero exit status, I/O failure, or timeout
    /// surfaces as a process error carrying captured stderr.
    async fn dump_to(&self, dest: &Path) -> Result<u64>;
}

/// `mysqldump`-based executor, gzip-compressing in process
#[derive(Debug)]
pub struct MysqldumpExecutor {
    command: PathBuf,
    database: DatabaseConfig,
    timeout: Duration,
}

impl MysqldumpExecutor {
    pub fn new(config: &VaultConfig) -> Result<Self> {
        validate_dump_flags(&config.database.dump_flags)?;
        Ok(Self {
            command: PathBuf::from("mysqldump"),
            database: config.database.clone(),
            timeout: Duration::from_secs(config.limits.dump_timeout_secs),
        })
    }

    fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--host={}", self.database.host),
            format!("--port={}", self.database.port),
            format!("--user={}", self.database.user),
        ];
        if let Some(password) = &self.database.password {
            args.push(format!("--password={password}"));
        }
        args.extend(self.database.dump_flags.iter().cloned());
        args.push(self.database.database.clone());
        args
    }
}

#[async_trait]
impl DumpExecutor for MysqldumpExecutor {
    async fn dump_to(&self, dest: &Path) -> Result<u64> {
        let args = self.build_args();
        debug!(command = %self.command.display(), database = %self.database.database, "spawning dump subprocess");

        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BackupError::process(
                    format!("failed to spawn {}: {e}", self.command.display()),
                    String::new(),
                )
            })?;

        let mut stdout = child.stdout.take().ok_or_else(|| {
            BackupError::process("dump subprocess has no stdout handle", String::new())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            BackupError::process("dump subprocess has no stderr handle", String::new())
        })?;

        let stderr_task = tokio::spawn(async move {
            let mut captured = Vec::new();
            let mut limited = stderr.take(STDERR_CAPTURE_LIMIT);
            if let Err(e) = limited.read_to_end(&mut captured).await {
                warn!(error = %e, "failed to capture dump stderr");
            }
            String::from_utf8_lossy(&captured).trim().to_string()
        });

        let file = std::fs::File::create(dest).map_err(|e| {
            BackupError::process(
                format!("failed to create staged file {}: {e}", dest.display()),
                String::new(),
            )
        })?;
        let mut encoder = GzEncoder::new(file, Compression::default());

        let pipeline = async {
            let mut buf = vec![0u8; READ_CHUNK];
            let mut payload_bytes = 0u64;
            loop {
                let n = stdout.read(&mut buf).await.map_err(|e| {
                    BackupError::process(format!("failed to read dump output: {e}"), String::new())
                })?;
                if n == 0 {
                    break;
                }
                encoder.write_all(&buf[..n]).map_err(|e| {
                    BackupError::process(
                        format!("failed to write staged file {}: {e}", dest.display()),
                        String::new(),
                    )
                })?;
                payload_bytes += n as u64;
            }
            let file = encoder.finish().map_err(|e| {
                BackupError::process(
                    format!("failed to finish staged file {}: {e}", dest.display()),
                    String::new(),
                )
            })?;
            file.sync_all().map_err(|e| {
                BackupError::process(
                    format!("failed to sync staged file {}: {e}", dest.display()),
                    String::new(),
                )
            })?;
            let status = child.wait().await.map_err(|e| {
                BackupError::process(format!("failed to wait for dump subprocess: {e}"), String::new())
            })?;
            Ok::<_, BackupError>((payload_bytes, status))
        };

        let outcome = tokio::time::timeout(self.timeout, pipeline).await;
        match outcome {
            Ok(Ok((payload_bytes, status))) => {
                let stderr_text = stderr_task.await.unwrap_or_default();
                if !status.success() {
                    return Err(BackupError::process(
                        format!("dump subprocess exited with {status}"),
                        stderr_text,
                    ));
                }
                debug!(bytes = payload_bytes, "dump subprocess finished");
                Ok(payload_bytes)
            }
            Ok(Err(err)) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                let _ = stderr_task.await;
                Err(err)
            }
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                let stderr_text = stderr_task.await.unwrap_or_default();
                Err(BackupError::process(
                    format!("dump timed out after {:?} and was killed", self.timeout),
                    stderr_text,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script_executor(dir: &Path, script: &str, timeout: Duration) -> MysqldumpExecutor {
        let path = dir.join("fake-dump.sh");
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        MysqldumpExecutor {
            command: path,
            database: DatabaseConfig {
                database: "shop".to_string(),
                ..DatabaseConfig::default()
            },
            timeout,
        }
    }

    #[test]
    fn test_flag_validation() {
        assert!(validate_dump_flags(&["--single-transaction".to_string()]).is_ok());
        assert!(validate_dump_flags(&["--where=id > 5".to_string()]).is_err());
        assert!(validate_dump_flags(&["$(reboot)".to_string()]).is_err());
        assert!(validate_dump_flags(&["a;b".to_string()]).is_err());
        assert!(validate_dump_flags(&[]).is_ok());
    }

    #[test]
    fn test_build_args_order() {
        let database = DatabaseConfig {
            password: Some("hunter2".to_string()),
            database: "shop".to_string(),
            dump_flags: vec!["--quick".to_string()],
            ..DatabaseConfig::default()
        };
        let executor = MysqldumpExecutor {
            command: PathBuf::from("mysqldump"),
            database,
            timeout: Duration::from_secs(1),
        };
        let args = executor.build_args();
        assert_eq!(args[0], "--host=localhost");
        assert_eq!(args[1], "--port=3306");
        assert_eq!(args[2], "--user=backup");
        assert_eq!(args[3], "--password=hunter2");
        assert_eq!(args[4], "--quick");
        assert_eq!(args.last().map(String::as_str), Some("shop"));
    }

    #[tokio::test]
    async fn test_dump_streams_compressed_output() {
        let dir = TempDir::new().unwrap();
        let executor = script_executor(
            dir.path(),
            "#!/bin/sh\nprintf 'CREATE TABLE t (id INT);'\n",
            Duration::from_secs(10),
        );
        let dest = dir.path().join("out.sql.gz");

        let bytes = executor.dump_to(&dest).await.unwrap();
        assert_eq!(bytes, 24);

        let mut decoded = String::new();
        GzDecoder::new(std::fs::File::open(&dest).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "CREATE TABLE t (id INT);");
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let executor = script_executor(
            dir.path(),
            "#!/bin/sh\necho 'Access denied for user' >&2\nexit 2\n",
            Duration::from_secs(10),
        );
        let dest = dir.path().join("out.sql.gz");

        let err = executor.dump_to(&dest).await.unwrap_err();
        assert_eq!(err.category(), "process");
        assert!(err.stderr().unwrap().contains("Access denied"));
    }

    #[tokio::test]
    async fn test_timeout_kills_subprocess() {
        let dir = TempDir::new().unwrap();
        let executor = script_executor(
            dir.path(),
            "#!/bin/sh\nsleep 30\n",
            Duration::from_millis(200),
        );
        let dest = dir.path().join("out.sql.gz");

        let err = executor.dump_to(&dest).await.unwrap_err();
        assert_eq!(err.category(), "process");
        assert!(err.to_string().contains("timed out"));
    }
}
