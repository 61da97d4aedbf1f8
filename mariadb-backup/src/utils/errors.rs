//! Error taxonomy for backup, rotation and restore.
//!
//! Fatal errors abort the current pipeline; non-fatal ones are recorded as
//! [`Issue`]s in the structured result so nothing is silently dropped.

use crate::artifact::RetentionClass;
use crate::engine::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Invalid retention class: {0}")]
    InvalidClass(String),

    #[error("A {class} backup is already running for {}", target.display())]
    JobAlreadyRunning { class: RetentionClass, target: PathBuf },

    #[error("Artifact already exists: {}", .0.display())]
    ArtifactExists(PathBuf),

    #[error("Database dump failed: {0}")]
    DumpFailed(String),

    #[error("User export failed: {0}")]
    UserExportFailed(String),

    #[error("Manifest write failed: {0}")]
    ManifestWriteFailed(String),

    #[error("Failed to delete artifact {}: {reason}", path.display())]
    RotationDeleteFailed { path: PathBuf, reason: String },

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Artifact is not complete: {0}")]
    ArtifactIncomplete(String),

    #[error("Integrity mismatch for {component}: expected {expected}, found {actual}")]
    IntegrityMismatch {
        component: String,
        expected: String,
        actual: String,
    },

    #[error("Restore failed: {0}")]
    RestoreFailed(String),

    #[error("User replay failed: {0}")]
    UserReplayFailed(String),

    #[error("Replication configuration failed ({reason}): {message}")]
    ReplicationConfigFailed {
        reason: ReplicationFailure,
        message: String,
    },

    #[error("Replication verification inconclusive: {0}")]
    VerificationInconclusive(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;

/// Why a replica handshake did not take effect. The operator's remedy differs
/// per variant, so callers must not collapse them into a generic failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationFailure {
    /// The artifact carries no log coordinates (binary logging was off).
    MissingCoordinates,
    /// The source no longer has the requested log file or position.
    CoordinatesUnavailable,
    CredentialsRejected,
    SourceUnreachable,
    Rejected,
}

impl ReplicationFailure {
    /// Suggested next step for the operator.
    pub fn remedy(&self) -> &'static str {
        match self {
            ReplicationFailure::MissingCoordinates => {
                "take a new backup with binary logging enabled on the source"
            }
            ReplicationFailure::CoordinatesUnavailable => {
                "re-seed the replica from a newer backup"
            }
            ReplicationFailure::CredentialsRejected => {
                "check the replication user, password and REPLICATION SLAVE grant"
            }
            ReplicationFailure::SourceUnreachable => "check source host, port and firewall",
            ReplicationFailure::Rejected => "inspect the replica error log",
        }
    }
}

impl fmt::Display for ReplicationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplicationFailure::MissingCoordinates => "missing coordinates",
            ReplicationFailure::CoordinatesUnavailable => "coordinates unavailable on source",
            ReplicationFailure::CredentialsRejected => "credentials rejected",
            ReplicationFailure::SourceUnreachable => "source unreachable",
            ReplicationFailure::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Serializable discriminant of [`BackupError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidClass,
    JobAlreadyRunning,
    ArtifactExists,
    DumpFailed,
    UserExportFailed,
    ManifestWriteFailed,
    RotationDeleteFailed,
    ArtifactNotFound,
    ArtifactIncomplete,
    IntegrityMismatch,
    RestoreFailed,
    UserReplayFailed,
    ReplicationConfigFailed,
    VerificationInconclusive,
    Cancelled,
    Config,
    Io,
    Engine,
    Serialization,
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::InvalidClass(_) => ErrorKind::InvalidClass,
            BackupError::JobAlreadyRunning { .. } => ErrorKind::JobAlreadyRunning,
            BackupError::ArtifactExists(_) => ErrorKind::ArtifactExists,
            BackupError::DumpFailed(_) => ErrorKind::DumpFailed,
            BackupError::UserExportFailed(_) => ErrorKind::UserExportFailed,
            BackupError::ManifestWriteFailed(_) => ErrorKind::ManifestWriteFailed,
            BackupError::RotationDeleteFailed { .. } => ErrorKind::RotationDeleteFailed,
            BackupError::ArtifactNotFound(_) => ErrorKind::ArtifactNotFound,
            BackupError::ArtifactIncomplete(_) => ErrorKind::ArtifactIncomplete,
            BackupError::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            BackupError::RestoreFailed(_) => ErrorKind::RestoreFailed,
            BackupError::UserReplayFailed(_) => ErrorKind::UserReplayFailed,
            BackupError::ReplicationConfigFailed { .. } => ErrorKind::ReplicationConfigFailed,
            BackupError::VerificationInconclusive(_) => ErrorKind::VerificationInconclusive,
            BackupError::Cancelled => ErrorKind::Cancelled,
            BackupError::Config(_) => ErrorKind::Config,
            BackupError::Io(_) => ErrorKind::Io,
            BackupError::Engine(_) => ErrorKind::Engine,
            BackupError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Whether the error aborts the pipeline it occurred in.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            BackupError::UserExportFailed(_)
                | BackupError::RotationDeleteFailed { .. }
                | BackupError::UserReplayFailed(_)
                | BackupError::ReplicationConfigFailed { .. }
                | BackupError::VerificationInconclusive(_)
        )
    }
}

/// An error recorded in a structured result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationFailure>,
}

impl From<&BackupError> for Issue {
    fn from(err: &BackupError) -> Self {
        let replication = match err {
            BackupError::ReplicationConfigFailed { reason, .. } => Some(*reason),
            _ => None,
        };
        Issue {
            kind: err.kind(),
            message: err.to_string(),
            replication,
        }
    }
}

impl From<BackupError> for Issue {
    fn from(err: BackupError) -> Self {
        Issue::from(&err)
    }
}
