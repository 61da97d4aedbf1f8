//! Retention Rotator.
//!
//! Keeps the newest `keep` complete artifacts of a class and deletes the
//! rest. Order is by recorded creation time, newest first, ties broken by
//! id. Artifacts without a complete manifest are neither counted nor removed.

use crate::artifact::catalog::{entries_for_class, ArtifactEntry};
use crate::artifact::{ArtifactId, ArtifactStatus, RetentionClass};
use crate::utils::errors::{BackupError, Issue, Result};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Keep-count per class. 0 disables rotation for that class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub hourly_keep: u32,
    pub daily_keep: u32,
    pub monthly_keep: u32,
    pub manual_keep: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            hourly_keep: 24,
            daily_keep: 31,
            monthly_keep: 12,
            manual_keep: 0,
        }
    }
}

impl RetentionPolicy {
    pub fn keep_count(&self, class: RetentionClass) -> u32 {
        match class {
            RetentionClass::Hourly => self.hourly_keep,
            RetentionClass::Daily => self.daily_keep,
            RetentionClass::Monthly => self.monthly_keep,
            RetentionClass::Manual => self.manual_keep,
        }
    }
}

/// What a rotation pass did.
#[derive(Debug, Clone, Serialize)]
pub struct RotationReport {
    pub class: RetentionClass,
    pub keep: u32,
    /// Keep-count 0: nothing was examined
    pub skipped: bool,
    pub retained: Vec<ArtifactId>,
    pub deleted: Vec<ArtifactId>,
    pub ignored_partial: Vec<ArtifactId>,
    pub failures: Vec<Issue>,
}

impl RotationReport {
    fn new(class: RetentionClass, keep: u32) -> Self {
        Self {
            class,
            keep,
            skipped: false,
            retained: Vec::new(),
            deleted: Vec::new(),
            ignored_partial: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Sort newest first with a deterministic tiebreak.
pub fn order_newest_first(entries: &mut [ArtifactEntry]) {
    entries.sort_by(|a, b| {
        b.created_at()
            .cmp(&a.created_at())
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// Rotate `class` under `root`, deleting through `remove`. Individual
/// deletion failures are recorded and rotation continues.
pub fn rotate_with<F>(root: &Path, class: RetentionClass, keep: u32, mut remove: F) -> io::Result<RotationReport>
where
    F: FnMut(&Path) -> io::Result<()>,
{
    let mut report = RotationReport::new(class, keep);
    if keep == 0 {
        report.skipped = true;
        return Ok(report);
    }

    let (mut complete, partial): (Vec<_>, Vec<_>) = entries_for_class(root, class)?
        .into_iter()
        .partition(|e| e.status() == ArtifactStatus::Complete);
    report.ignored_partial = partial.into_iter().map(|e| e.id).collect();

    order_newest_first(&mut complete);
    let split = (keep as usize).min(complete.len());
    let expired = complete.split_off(split);
    report.retained = complete.into_iter().map(|e| e.id).collect();

    for entry in expired {
        match remove(&entry.dir) {
            Ok(()) => {
                info!(class = %class, artifact = %entry.id, "Deleted expired backup");
                report.deleted.push(entry.id);
            }
            Err(e) => {
                warn!(class = %class, artifact = %entry.id, error = %e, "Failed to delete expired backup");
                report.failures.push(Issue::from(BackupError::RotationDeleteFailed {
                    path: entry.dir.clone(),
                    reason: e.to_string(),
                }));
            }
        }
    }

    Ok(report)
}

/// Apply `policy` to the artifacts of `class` stored under `root`.
pub async fn apply_retention(root: &Path, class: RetentionClass, policy: &RetentionPolicy) -> Result<RotationReport> {
    let keep = policy.keep_count(class);
    let root: PathBuf = root.to_path_buf();
    let report = tokio::task::spawn_blocking(move || {
        rotate_with(&root, class, keep, |dir| std::fs::remove_dir_all(dir))
    })
    .await
    .map_err(|e| BackupError::Io(io::Error::other(e)))??;

    if !report.skipped {
        info!(
            class = %class,
            keep,
            retained = report.retained.len(),
            deleted = report.deleted.len(),
            failed = report.failures.len(),
            "Retention applied"
        );
    }
    Ok(report)
}
