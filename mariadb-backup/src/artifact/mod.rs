//! Artifact naming, manifests and the on-disk catalog.
//!
//! An artifact lives in `<class-root>/backup_<id>`. For periodic classes the
//! id is the capture time truncated (in UTC) to the class period, so a second
//! capture inside the same period resolves to the same directory and replaces
//! it. Manual ids keep full second precision.

pub mod catalog;
pub mod manifest;

use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use catalog::{list_backups, ArtifactSummary};
pub use manifest::{ArtifactStatus, Checkpoint, Component, ComponentKind, ComponentStatus, Manifest};

const ARTIFACT_PREFIX: &str = "backup_";
const STAGING_PREFIX: &str = ".staging_backup_";
const TRASH_PREFIX: &str = ".trash_backup_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionClass {
    Hourly,
    Daily,
    Monthly,
    Manual,
}

impl RetentionClass {
    pub const ALL: [RetentionClass; 4] = [
        RetentionClass::Hourly,
        RetentionClass::Daily,
        RetentionClass::Monthly,
        RetentionClass::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionClass::Hourly => "hourly",
            RetentionClass::Daily => "daily",
            RetentionClass::Monthly => "monthly",
            RetentionClass::Manual => "manual",
        }
    }

    /// Start of the period containing `at`. Manual keeps second precision.
    pub fn truncate(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let to_second = at.with_nanosecond(0).unwrap_or(at);
        let to_hour = to_second
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .unwrap_or(to_second);
        let to_day = to_hour.with_hour(0).unwrap_or(to_hour);

        match self {
            RetentionClass::Manual => to_second,
            RetentionClass::Hourly => to_hour,
            RetentionClass::Daily => to_day,
            RetentionClass::Monthly => to_day.with_day(1).unwrap_or(to_day),
        }
    }

    fn id_format(&self) -> &'static str {
        match self {
            RetentionClass::Hourly => "%Y%m%d_%H",
            RetentionClass::Daily => "%Y%m%d",
            RetentionClass::Monthly => "%Y%m",
            RetentionClass::Manual => "%Y%m%d_%H%M%S",
        }
    }
}

impl fmt::Display for RetentionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetentionClass {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(RetentionClass::Hourly),
            "daily" => Ok(RetentionClass::Daily),
            "monthly" => Ok(RetentionClass::Monthly),
            "manual" => Ok(RetentionClass::Manual),
            other => Err(BackupError::InvalidClass(other.to_string())),
        }
    }
}

/// Period key of an artifact. Pure function of (class, capture time).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn for_capture(class: RetentionClass, at: DateTime<Utc>) -> Self {
        ArtifactId(class.truncate(at).format(class.id_format()).to_string())
    }

    /// Recover an id from a `backup_<id>` directory name.
    pub fn from_dir_name(name: &str) -> Option<Self> {
        let id = name.strip_prefix(ARTIFACT_PREFIX)?;
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit() || b == b'_') {
            return None;
        }
        Some(ArtifactId(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn dir_name(&self) -> String {
        format!("{ARTIFACT_PREFIX}{}", self.0)
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of the capture time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Where a backup invocation writes, resolved by the namer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactTarget {
    pub class: RetentionClass,
    pub id: ArtifactId,
    pub captured_at: DateTime<Utc>,
    pub root: PathBuf,
}

impl ArtifactTarget {
    /// Resolve the target for a capture. A path override is only accepted for
    /// manual backups.
    pub fn resolve(
        class: RetentionClass,
        captured_at: DateTime<Utc>,
        class_root: &Path,
        path_override: Option<&Path>,
    ) -> Result<Self> {
        let root = match path_override {
            Some(path) if class == RetentionClass::Manual => path.to_path_buf(),
            Some(_) => {
                return Err(BackupError::Config(format!(
                    "a path override is only accepted for manual backups, not {class}"
                )))
            }
            None => class_root.to_path_buf(),
        };

        Ok(Self {
            class,
            id: ArtifactId::for_capture(class, captured_at),
            captured_at,
            root,
        })
    }

    /// Final artifact directory.
    pub fn dir(&self) -> PathBuf {
        self.root.join(self.id.dir_name())
    }

    /// Directory the pipeline writes into before promotion.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(format!("{STAGING_PREFIX}{}", self.id))
    }

    /// Where a superseded artifact is parked while being replaced.
    pub fn trash_dir(&self) -> PathBuf {
        self.root.join(format!("{TRASH_PREFIX}{}", self.id))
    }

    /// Advisory lock guarding this target.
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(format!(".{}.lock", self.id.dir_name()))
    }
}
