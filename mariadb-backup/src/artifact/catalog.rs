//! On-disk catalog of artifacts.
//!
//! All durable state is the directory tree, so listing, rotation and restore
//! lookups all start by re-reading it here.

use super::manifest::{ArtifactStatus, Checkpoint, ComponentKind, Manifest, MANIFEST_FILE};
use super::{ArtifactId, RetentionClass};
use crate::config::BackupPaths;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// One `backup_<id>` directory as found on disk.
#[derive(Debug, Clone)]
pub struct ArtifactEntry {
    pub id: ArtifactId,
    pub dir: PathBuf,
    /// `None` when the manifest is absent or unreadable
    pub manifest: Option<Manifest>,
    pub modified: DateTime<Utc>,
}

impl ArtifactEntry {
    pub fn status(&self) -> ArtifactStatus {
        self.manifest
            .as_ref()
            .map(|m| m.status)
            .unwrap_or(ArtifactStatus::Partial)
    }

    /// Manifest creation time, falling back to the directory mtime.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.manifest
            .as_ref()
            .map(|m| m.created_at)
            .unwrap_or(self.modified)
    }

    pub fn class(&self) -> Option<RetentionClass> {
        self.manifest.as_ref().map(|m| m.class)
    }
}

/// Listing row returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactSummary {
    pub id: ArtifactId,
    pub class: RetentionClass,
    pub path: PathBuf,
    pub status: ArtifactStatus,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub has_users: bool,
    pub checkpoint: Option<Checkpoint>,
}

/// Enumerate artifact directories directly under `root`. A missing root is
/// an empty catalog.
pub fn scan_root(root: &Path) -> std::io::Result<Vec<ArtifactEntry>> {
    let read_dir = match std::fs::read_dir(root) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut entries = Vec::new();
    for entry in read_dir {
        let entry = entry?;
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(ArtifactId::from_dir_name) else {
            continue;
        };
        let metadata = entry.metadata()?;
        if !metadata.is_dir() {
            continue;
        }

        let dir = entry.path();
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        entries.push(ArtifactEntry {
            manifest: read_manifest(&dir),
            id,
            dir,
            modified,
        });
    }
    Ok(entries)
}

fn read_manifest(dir: &Path) -> Option<Manifest> {
    let bytes = std::fs::read(dir.join(MANIFEST_FILE)).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            warn!("Unreadable manifest in {}: {}", dir.display(), e);
            None
        }
    }
}

/// Total size of regular files below `dir`.
pub fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Entries of `class` under its root. Directories without a manifest cannot
/// prove their class and are attributed to the root they sit in.
pub fn entries_for_class(root: &Path, class: RetentionClass) -> std::io::Result<Vec<ArtifactEntry>> {
    Ok(scan_root(root)?
        .into_iter()
        .filter(|e| e.class().map_or(true, |c| c == class))
        .collect())
}

fn list_blocking(paths: &BackupPaths, filter: Option<RetentionClass>) -> std::io::Result<Vec<ArtifactSummary>> {
    // Classes may share a root; scan each root once.
    let mut roots: Vec<(PathBuf, RetentionClass)> = Vec::new();
    for class in RetentionClass::ALL {
        let root = paths.root(class);
        if !roots.iter().any(|(r, _)| r == root) {
            roots.push((root.to_path_buf(), class));
        }
    }

    let mut summaries = Vec::new();
    for (root, root_class) in roots {
        for entry in scan_root(&root)? {
            let class = entry.class().unwrap_or(root_class);
            if filter.is_some_and(|f| f != class) {
                continue;
            }
            summaries.push(ArtifactSummary {
                class,
                status: entry.status(),
                created_at: entry.created_at(),
                size_bytes: dir_size(&entry.dir),
                has_users: entry
                    .manifest
                    .as_ref()
                    .is_some_and(|m| m.written(ComponentKind::Users).is_some()),
                checkpoint: entry.manifest.as_ref().map(|m| m.checkpoint.clone()),
                id: entry.id,
                path: entry.dir,
            });
        }
    }

    summaries.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    Ok(summaries)
}

/// List artifacts across all configured class roots, newest first.
pub async fn list_backups(
    paths: &BackupPaths,
    filter: Option<RetentionClass>,
) -> Result<Vec<ArtifactSummary>> {
    let paths = paths.clone();
    let summaries = tokio::task::spawn_blocking(move || list_blocking(&paths, filter))
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;
    Ok(summaries)
}

/// Find an artifact by id (`20240309`) or directory name (`backup_20240309`).
pub async fn find_artifact(paths: &BackupPaths, reference: &str) -> Result<ArtifactSummary> {
    let id = reference.strip_prefix("backup_").unwrap_or(reference);
    list_backups(paths, None)
        .await?
        .into_iter()
        .find(|s| s.id.as_str() == id)
        .ok_or_else(|| BackupError::ArtifactNotFound(reference.to_string()))
}
