//! Manifest types and integrity records.
//!
//! A manifest is serialized as `manifest.json` in each artifact directory and
//! is written last: an artifact directory without one is partial. Next to it,
//! `checksums.sha256` lists `<sha256>  <relative path>` for every component.

use super::{ArtifactId, RetentionClass};
use crate::transfer::{sha256_file, Encoding};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::io::AsyncWriteExt;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const CHECKSUM_FILE: &str = "checksums.sha256";
pub const MANIFEST_VERSION: u32 = 1;

/// Replication position the dump corresponds to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// `None` when binary logging is disabled on the source
    pub log_file: Option<String>,
    pub log_position: Option<u64>,
    pub server_id: Option<String>,
    pub server_identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binlog_do_db: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binlog_ignore_db: Option<String>,
    pub source: CheckpointSource,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    /// Coordinates written by the dump tool at its snapshot point
    DumpHeader,
    /// `SHOW MASTER STATUS` read next to the dump
    MasterStatus,
    Unavailable,
}

impl Checkpoint {
    pub fn unavailable(captured_at: DateTime<Utc>) -> Self {
        Self {
            log_file: None,
            log_position: None,
            server_id: None,
            server_identity: None,
            binlog_do_db: None,
            binlog_ignore_db: None,
            source: CheckpointSource::Unavailable,
            captured_at,
        }
    }

    /// Log file and position, if both are known.
    pub fn coordinates(&self) -> Option<(&str, u64)> {
        match (&self.log_file, self.log_position) {
            (Some(file), Some(pos)) if !file.is_empty() => Some((file.as_str(), pos)),
            _ => None,
        }
    }

    /// Only checkpoints with coordinates can seed a replica.
    pub fn has_coordinates(&self) -> bool {
        self.coordinates().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Full dump of every schema; required
    Data,
    /// `CREATE USER` / `GRANT` script; optional
    Users,
}

impl ComponentKind {
    pub fn base_name(&self) -> &'static str {
        match self {
            ComponentKind::Data => "all_databases.sql",
            ComponentKind::Users => "users_and_grants.sql",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Written,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub kind: ComponentKind,
    pub relative_path: String,
    pub encoding: Encoding,
    pub status: ComponentStatus,
    pub digest: Option<String>,
    pub byte_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Diagnostic output of the external tool
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Complete,
    Partial,
    Failed,
}

/// Backup manifest, serialized as `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub id: ArtifactId,
    pub class: RetentionClass,
    pub status: ArtifactStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub host: String,
    pub tool_version: String,
    pub checkpoint: Checkpoint,
    pub components: Vec<Component>,
}

/// A component file as left by the dump adapter, before hashing.
#[derive(Debug, Clone)]
pub struct ProducedComponent {
    pub kind: ComponentKind,
    pub relative_path: String,
    pub encoding: Encoding,
    pub error: Option<String>,
    pub stderr: String,
}

impl ProducedComponent {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Assembles a manifest from produced components, hashing each one.
pub struct ManifestBuilder {
    id: ArtifactId,
    class: RetentionClass,
    created_at: DateTime<Utc>,
    checkpoint: Checkpoint,
    produced: Vec<ProducedComponent>,
}

impl ManifestBuilder {
    pub fn new(
        id: ArtifactId,
        class: RetentionClass,
        created_at: DateTime<Utc>,
        checkpoint: Checkpoint,
    ) -> Self {
        Self {
            id,
            class,
            created_at,
            checkpoint,
            produced: Vec::new(),
        }
    }

    pub fn add(&mut self, component: ProducedComponent) -> &mut Self {
        self.produced.push(component);
        self
    }

    /// Hash every written component under `dir`. The artifact is `Complete`
    /// only when the data component was written.
    pub async fn build(self, dir: &Path) -> Result<Manifest> {
        let mut components = Vec::with_capacity(self.produced.len());

        for produced in self.produced {
            let (status, digest, byte_size) = if produced.succeeded() {
                let digest = sha256_file(&dir.join(&produced.relative_path))
                    .await
                    .map_err(|e| {
                        BackupError::ManifestWriteFailed(format!(
                            "cannot hash {}: {e}",
                            produced.relative_path
                        ))
                    })?;
                (ComponentStatus::Written, Some(digest.sha256), digest.byte_size)
            } else {
                (ComponentStatus::Failed, None, 0)
            };

            components.push(Component {
                kind: produced.kind,
                relative_path: produced.relative_path,
                encoding: produced.encoding,
                status,
                digest,
                byte_size,
                error: produced.error,
                stderr: produced.stderr,
            });
        }

        let data_written = components
            .iter()
            .any(|c| c.kind == ComponentKind::Data && c.status == ComponentStatus::Written);

        Ok(Manifest {
            version: MANIFEST_VERSION,
            id: self.id,
            class: self.class,
            status: if data_written {
                ArtifactStatus::Complete
            } else {
                ArtifactStatus::Failed
            },
            created_at: self.created_at,
            completed_at: Utc::now(),
            host: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            checkpoint: self.checkpoint,
            components,
        })
    }
}

impl Manifest {
    pub fn component(&self, kind: ComponentKind) -> Option<&Component> {
        self.components.iter().find(|c| c.kind == kind)
    }

    /// Written component of `kind`, if any.
    pub fn written(&self, kind: ComponentKind) -> Option<&Component> {
        self.component(kind)
            .filter(|c| c.status == ComponentStatus::Written)
    }

    /// Components that were attempted but failed.
    pub fn missing_components(&self) -> Vec<ComponentKind> {
        self.components
            .iter()
            .filter(|c| c.status == ComponentStatus::Failed)
            .map(|c| c.kind)
            .collect()
    }

    /// Read `manifest.json` from an artifact directory.
    pub async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::ArtifactNotFound(format!(
                    "no manifest in {}",
                    dir.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&content)?)
    }

    /// Write the checksum listing, then the manifest, each via rename.
    pub async fn persist(&self, dir: &Path) -> Result<()> {
        let listing: String = self
            .components
            .iter()
            .filter_map(|c| {
                c.digest
                    .as_ref()
                    .map(|d| format!("{d}  {}\n", c.relative_path))
            })
            .collect();
        let manifest_json = serde_json::to_vec_pretty(self)?;

        write_atomic(&dir.join(CHECKSUM_FILE), listing.as_bytes())
            .await
            .map_err(|e| BackupError::ManifestWriteFailed(format!("{CHECKSUM_FILE}: {e}")))?;
        write_atomic(&dir.join(MANIFEST_FILE), &manifest_json)
            .await
            .map_err(|e| BackupError::ManifestWriteFailed(format!("{MANIFEST_FILE}: {e}")))?;
        Ok(())
    }

    /// Recompute every written component's digest and compare it with both
    /// the manifest and the checksum listing.
    pub async fn verify(&self, dir: &Path) -> Result<()> {
        let listing = read_checksums(dir).await?;

        for component in self
            .components
            .iter()
            .filter(|c| c.status == ComponentStatus::Written)
        {
            let expected = component.digest.clone().unwrap_or_default();
            let listed = listing
                .get(&component.relative_path)
                .cloned()
                .unwrap_or_else(|| "<unlisted>".to_string());
            if listed != expected {
                return Err(BackupError::IntegrityMismatch {
                    component: format!("{} ({CHECKSUM_FILE})", component.relative_path),
                    expected,
                    actual: listed,
                });
            }

            let actual = match sha256_file(&dir.join(&component.relative_path)).await {
                Ok(digest) => digest.sha256,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => "<missing>".to_string(),
                Err(e) => return Err(e.into()),
            };
            if actual != expected {
                return Err(BackupError::IntegrityMismatch {
                    component: component.relative_path.clone(),
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }
}

/// Parse `checksums.sha256` into relative path -> digest.
pub async fn read_checksums(dir: &Path) -> Result<HashMap<String, String>> {
    let content = match tokio::fs::read_to_string(dir.join(CHECKSUM_FILE)).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BackupError::IntegrityMismatch {
                component: CHECKSUM_FILE.to_string(),
                expected: "present".to_string(),
                actual: "<missing>".to_string(),
            })
        }
        Err(e) => return Err(e.into()),
    };

    Ok(content
        .lines()
        .filter_map(|line| {
            let (digest, path) = line.split_once("  ")?;
            Some((path.to_string(), digest.to_string()))
        })
        .collect())
}

async fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::errors::ErrorKind;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn checkpoint() -> Checkpoint {
        Checkpoint {
            log_file: Some("mysql-bin.000042".into()),
            log_position: Some(1337),
            server_id: Some("1".into()),
            server_identity: Some("db1".into()),
            binlog_do_db: None,
            binlog_ignore_db: None,
            source: CheckpointSource::DumpHeader,
            captured_at: Utc.with_ymd_and_hms(2024, 3, 9, 14, 0, 0).single().expect("time"),
        }
    }

    fn produced(kind: ComponentKind, error: Option<&str>) -> ProducedComponent {
        ProducedComponent {
            kind,
            relative_path: kind.base_name().to_string(),
            encoding: Encoding::default(),
            error: error.map(str::to_string),
            stderr: String::new(),
        }
    }

    async fn built(dir: &Path, users_error: Option<&str>) -> Result<Manifest> {
        tokio::fs::write(dir.join("all_databases.sql"), b"CREATE DATABASE a;\n").await?;
        if users_error.is_none() {
            tokio::fs::write(dir.join("users_and_grants.sql"), b"GRANT USAGE ON *.* TO 'a'@'%';\n")
                .await?;
        }

        let cp = checkpoint();
        let mut builder =
            ManifestBuilder::new(ArtifactId::for_capture(RetentionClass::Daily, cp.captured_at), RetentionClass::Daily, cp.captured_at, cp);
        builder
            .add(produced(ComponentKind::Data, None))
            .add(produced(ComponentKind::Users, users_error));
        builder.build(dir).await
    }

    #[tokio::test]
    async fn test_complete_manifest_persists_and_verifies() -> Result<()> {
        let dir = tempdir()?;
        let manifest = built(dir.path(), None).await?;
        assert_eq!(manifest.status, ArtifactStatus::Complete);
        assert_eq!(manifest.written(ComponentKind::Data).map(|c| c.byte_size), Some(19));

        manifest.persist(dir.path()).await?;
        let loaded = Manifest::load(dir.path()).await?;
        assert_eq!(loaded, manifest);
        loaded.verify(dir.path()).await?;

        let listing = read_checksums(dir.path()).await?;
        assert_eq!(listing.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_user_export_failure_keeps_artifact_complete() -> Result<()> {
        let dir = tempdir()?;
        let manifest = built(dir.path(), Some("access denied")).await?;
        assert_eq!(manifest.status, ArtifactStatus::Complete);
        assert_eq!(manifest.missing_components(), vec![ComponentKind::Users]);
        assert!(manifest.written(ComponentKind::Users).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_single_byte_change_is_detected() -> Result<()> {
        let dir = tempdir()?;
        let manifest = built(dir.path(), None).await?;
        manifest.persist(dir.path()).await?;

        let path = dir.path().join("all_databases.sql");
        let mut bytes = tokio::fs::read(&path).await?;
        bytes[0] ^= 0x01;
        tokio::fs::write(&path, bytes).await?;

        let err = manifest.verify(dir.path()).await.expect_err("tampered");
        assert_eq!(err.kind(), ErrorKind::IntegrityMismatch);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_manifest_is_not_found() -> Result<()> {
        let dir = tempdir()?;
        let err = Manifest::load(dir.path()).await.expect_err("absent");
        assert_eq!(err.kind(), ErrorKind::ArtifactNotFound);
        Ok(())
    }

    #[test]
    fn test_checkpoint_coordinates() {
        assert_eq!(checkpoint().coordinates(), Some(("mysql-bin.000042", 1337)));
        assert!(!Checkpoint::unavailable(Utc::now()).has_coordinates());
    }
}
