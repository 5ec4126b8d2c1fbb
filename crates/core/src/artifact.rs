/*
 * SPDX-FileCopyrightText: 2024 DBVault Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Backup classes and committed artifact records

use crate::error::{BackupError, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

/// Timestamp component embedded in artifact file names
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// File extension of every committed artifact
pub const ARTIFACT_SUFFIX: &str = ".sql.gz";

/// File extension of the digest sidecar
pub const DIGEST_SUFFIX: &str = ".sha256";

/// Backup cadence bucket
///
/// The class decides the storage subdirectory, the retention count, and the
/// schedule cadence. It is fixed for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupClass {
    Daily,
    Weekly,
    Monthly,
}

impl BackupClass {
    /// All classes, in schedule order
    pub const ALL: [BackupClass; 3] = [
        BackupClass::Daily,
        BackupClass::Weekly,
        BackupClass::Monthly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupClass::Daily => "daily",
            BackupClass::Weekly => "weekly",
            BackupClass::Monthly => "monthly",
        }
    }

    /// Subdirectory of the storage root holding this class's artifacts
    pub fn subdir(&self) -> &'static str {
        self.as_str()
    }
}

impl std::fmt::Display for BackupClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupClass {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "daily" => Ok(BackupClass::Daily),
            "weekly" => Ok(BackupClass::Weekly),
            "monthly" => Ok(BackupClass::Monthly),
            other => Err(BackupError::configuration(format!(
                "unknown backup class: {other}"
            ))),
        }
    }
}

/// One committed backup: the artifact file plus its digest sidecar
///
/// Instances are created by a successful commit or recovered from a class
/// directory scan; they are deleted only by the retention sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub class: BackupClass,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
    pub digest_path: PathBuf,
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the artifact bytes. Empty when the sidecar
    /// was missing or unreadable during a scan; such artifacts fail
    /// verification and age out through retention like any other.
    pub digest: String,
}

/// Digest sidecar path for an artifact path
pub fn digest_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(DIGEST_SUFFIX);
    PathBuf::from(name)
}

/// Artifact file name for one run: `<db>_<class>_<YYYYMMDD_HHMMSS>.sql.gz`
pub fn artifact_file_name(database: &str, class: BackupClass, at: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}{}",
        database,
        class.as_str(),
        at.format(TIMESTAMP_FORMAT),
        ARTIFACT_SUFFIX
    )
}

/// Parse the creation timestamp out of an artifact file name
///
/// Returns `None` for names that do not follow the layout, including
/// artifacts whose class component disagrees with `class`. Database names may
/// themselves contain underscores, so the name is split from the right.
pub fn parse_file_name(name: &str, class: BackupClass) -> Option<DateTime<Utc>> {
    let stem = name.strip_suffix(ARTIFACT_SUFFIX)?;
    let mut parts = stem.rsplitn(4, '_');
    let time = parts.next()?;
    let date = parts.next()?;
    let class_part = parts.next()?;
    let database = parts.next()?;
    if database.is_empty() || class_part != class.as_str() {
        return None;
    }
    let naive =
        NaiveDateTime::parse_from_str(&format!("{date}_{time}"), TIMESTAMP_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Scan a class directory for committed artifacts, newest first
///
/// Files that do not match the artifact layout are skipped with a warning.
/// The digest sidecar is read for each artifact; a missing sidecar is a
/// broken invariant worth surfacing, but it never aborts the scan.
pub async fn scan_class_dir(dir: &Path, class: BackupClass) -> Result<Vec<BackupArtifact>> {
    let mut artifacts = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| BackupError::storage(format!("failed to list {}: {e}", dir.display())))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| BackupError::storage(format!("failed to list {}: {e}", dir.display())))?
    {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(ARTIFACT_SUFFIX) {
            continue;
        }
        let Some(created_at) = parse_file_name(name, class) else {
            warn!(file = name, class = %class, "ignoring file with unrecognized name in class directory");
            continue;
        };
        let metadata = entry
            .metadata()
            .await
            .map_err(|e| BackupError::storage(format!("failed to stat {}: {e}", path.display())))?;
        let digest_path = digest_path(&path);
        let digest = match tokio::fs::read_to_string(&digest_path).await {
            Ok(contents) => contents.trim().to_string(),
            Err(e) => {
                warn!(
                    artifact = %path.display(),
                    error = %e,
                    "artifact has no readable digest sidecar"
                );
                String::new()
            }
        };
        artifacts.push(BackupArtifact {
            class,
            created_at,
            path,
            digest_path,
            size_bytes: metadata.len(),
            digest,
        });
    }

    artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ts(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 30, 15).unwrap()
    }

    #[test]
    fn test_class_roundtrip() {
        for class in BackupClass::ALL {
            assert_eq!(class.as_str().parse::<BackupClass>().unwrap(), class);
        }
        assert!("hourly".parse::<BackupClass>().is_err());
    }

    #[test]
    fn test_file_name_roundtrip() {
        let at = ts(2024, 3, 9, 4);
        let name = artifact_file_name("shop", BackupClass::Daily, at);
        assert_eq!(name, "shop_daily_20240309_043015.sql.gz");
        assert_eq!(parse_file_name(&name, BackupClass::Daily), Some(at));
    }

    #[test]
    fn test_file_name_with_underscored_database() {
        let at = ts(2025, 12, 31, 23);
        let name = artifact_file_name("order_history_eu", BackupClass::Weekly, at);
        assert_eq!(parse_file_name(&name, BackupClass::Weekly), Some(at));
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert_eq!(parse_file_name("shop.sql.gz", BackupClass::Daily), None);
        assert_eq!(
            parse_file_name("shop_daily_20240309_043015.sql", BackupClass::Daily),
            None
        );
        // wrong class for the directory being scanned
        assert_eq!(
            parse_file_name("shop_weekly_20240309_043015.sql.gz", BackupClass::Daily),
            None
        );
        // garbage timestamp
        assert_eq!(
            parse_file_name("shop_daily_2024_999999.sql.gz", BackupClass::Daily),
            None
        );
    }

    #[test]
    fn test_digest_path() {
        assert_eq!(
            digest_path(Path::new("/b/daily/a.sql.gz")),
            PathBuf::from("/b/daily/a.sql.gz.sha256")
        );
    }

    #[tokio::test]
    async fn test_scan_sorts_newest_first_and_skips_strays() {
        let dir = TempDir::new().unwrap();
        for day in [3u32, 1, 2] {
            let at = ts(2024, 5, day, 0);
            let name = artifact_file_name("shop", BackupClass::Daily, at);
            let path = dir.path().join(&name);
            std::fs::write(&path, b"data").unwrap();
            std::fs::write(digest_path(&path), "abc123\n").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"stray").unwrap();

        let artifacts = scan_class_dir(dir.path(), BackupClass::Daily).await.unwrap();
        assert_eq!(artifacts.len(), 3);
        assert_eq!(artifacts[0].created_at, ts(2024, 5, 3, 0));
        assert_eq!(artifacts[2].created_at, ts(2024, 5, 1, 0));
        assert!(artifacts.iter().all(|a| a.digest == "abc123"));
        assert!(artifacts.iter().all(|a| a.size_bytes == 4));
    }
}
