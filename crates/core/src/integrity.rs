/*
 * SPDX-FileCopyrightText: 2024 DBVault Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Checksum-based integrity verification
//!
//! Every artifact carries a sidecar file holding one lowercase hex SHA-256
//! line. An artifact is only considered valid while its bytes hash to the
//! sidecar's digest.

use crate::artifact::digest_path;
use crate::error::{BackupError, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::debug;

const HASH_CHUNK: usize = 64 * 1024;

/// Computes and checks artifact digests
#[derive(Debug, Clone)]
pub struct IntegrityVerifier {
    /// Files at or under this size are always re-hashed by [`verify`];
    /// only larger files may fail fast on an expected-size mismatch. Keeps
    /// truncation bugs from hiding behind a size shortcut.
    ///
    /// [`verify`]: IntegrityVerifier::verify
    size_ceiling: u64,
}

impl IntegrityVerifier {
    pub fn new(size_ceiling: u64) -> Self {
        Self { size_ceiling }
    }

    /// Compute the SHA-256 digest of a file as lowercase hex
    ///
    /// Streams the file; deterministic, no side effects. An unreadable file
    /// is an integrity error with the `unreadable` sub-reason.
    pub async fn compute_digest(&self, path: &Path) -> Result<String> {
        let mut file = tokio::fs::File::open(path).await.map_err(|e| {
            BackupError::integrity_unreadable(format!("failed to open {}: {e}", path.display()))
        })?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_CHUNK];
        loop {
            let n = file.read(&mut buf).await.map_err(|e| {
                BackupError::integrity_unreadable(format!(
                    "failed to read {}: {e}",
                    path.display()
                ))
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Write the digest sidecar next to an artifact: one hex line
    pub async fn write_digest_file(&self, artifact: &Path, digest: &str) -> Result<()> {
        let sidecar = digest_path(artifact);
        tokio::fs::write(&sidecar, format!("{digest}\n"))
            .await
            .map_err(|e| {
                BackupError::storage(format!(
                    "failed to write digest sidecar {}: {e}",
                    sidecar.display()
                ))
            })
    }

    /// Read the digest recorded in an artifact's sidecar
    pub async fn read_digest_file(&self, artifact: &Path) -> Result<String> {
        let sidecar = digest_path(artifact);
        let contents = tokio::fs::read_to_string(&sidecar).await.map_err(|e| {
            BackupError::integrity_unreadable(format!(
                "failed to read digest sidecar {}: {e}",
                sidecar.display()
            ))
        })?;
        let digest = contents.trim();
        if digest.is_empty() {
            return Err(BackupError::integrity_unreadable(format!(
                "digest sidecar {} is empty",
                sidecar.display()
            )));
        }
        Ok(digest.to_string())
    }

    /// Recompute a file's digest and compare it to `expected`
    ///
    /// When the caller knows the expected size, a disagreement may
    /// short-circuit to a mismatch verdict, but only for files larger than
    /// the configured ceiling; smaller files are always re-hashed in full.
    pub async fn verify(
        &self,
        path: &Path,
        expected: &str,
        expected_size: Option<u64>,
    ) -> Result<()> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            BackupError::integrity_unreadable(format!("failed to stat {}: {e}", path.display()))
        })?;
        if let Some(size) = expected_size {
            if metadata.len() != size && metadata.len() > self.size_ceiling {
                return Err(BackupError::integrity_mismatch(format!(
                    "{} is {} bytes, expected {size}",
                    path.display(),
                    metadata.len()
                )));
            }
        }

        let actual = self.compute_digest(path).await?;
        if actual != expected {
            return Err(BackupError::integrity_mismatch(format!(
                "{}: expected {expected}, got {actual}",
                path.display()
            )));
        }
        debug!(path = %path.display(), "integrity verified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IntegrityReason;
    use tempfile::TempDir;

    const HELLO_SHA256: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn reason(err: &BackupError) -> IntegrityReason {
        match err {
            BackupError::Integrity { reason, .. } => *reason,
            other => panic!("expected integrity error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_compute_digest_known_value() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifact");
        std::fs::write(&path, b"hello world").unwrap();

        let verifier = IntegrityVerifier::new(1024);
        assert_eq!(verifier.compute_digest(&path).await.unwrap(), HELLO_SHA256);
    }

    #[tokio::test]
    async fn test_sidecar_roundtrip_and_verify() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifact");
        std::fs::write(&path, b"hello world").unwrap();

        let verifier = IntegrityVerifier::new(1024);
        let digest = verifier.compute_digest(&path).await.unwrap();
        verifier.write_digest_file(&path, &digest).await.unwrap();

        assert_eq!(verifier.read_digest_file(&path).await.unwrap(), digest);
        verifier.verify(&path, &digest, Some(11)).await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatch_is_distinct_from_unreadable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifact");
        std::fs::write(&path, b"hello world").unwrap();

        let verifier = IntegrityVerifier::new(1024);
        let err = verifier
            .verify(&path, "0000000000000000", None)
            .await
            .unwrap_err();
        assert_eq!(reason(&err), IntegrityReason::Mismatch);

        let err = verifier
            .compute_digest(&dir.path().join("missing"))
            .await
            .unwrap_err();
        assert_eq!(reason(&err), IntegrityReason::Unreadable);
    }

    #[tokio::test]
    async fn test_missing_sidecar_is_unreadable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifact");
        std::fs::write(&path, b"hello world").unwrap();

        let verifier = IntegrityVerifier::new(1024);
        let err = verifier.read_digest_file(&path).await.unwrap_err();
        assert_eq!(reason(&err), IntegrityReason::Unreadable);
    }

    #[tokio::test]
    async fn test_size_shortcut_only_above_ceiling() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifact");
        std::fs::write(&path, b"hello world").unwrap();
        let verifier = IntegrityVerifier::new(4);

        // 11 bytes > ceiling of 4: a size disagreement may fail fast.
        let err = verifier
            .verify(&path, HELLO_SHA256, Some(999))
            .await
            .unwrap_err();
        assert_eq!(reason(&err), IntegrityReason::Mismatch);

        // At or under the ceiling the digest decides, not the size hint.
        let verifier = IntegrityVerifier::new(1024);
        verifier.verify(&path, HELLO_SHA256, Some(999)).await.unwrap();
    }
}
