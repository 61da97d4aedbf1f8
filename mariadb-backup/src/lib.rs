//! MariaDB Backup Library
//!
//! Checkpointed backups of a replicated MariaDB cluster: per-class artifact
//! naming and overwrite, retention, integrity-checked restore and replica
//! re-seeding from the recorded binlog position.

pub mod artifact;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod executor;
pub mod notify;
pub mod restore;
pub mod retention;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use artifact::{ArtifactSummary, RetentionClass};
pub use config::Config;
pub use executor::{BackupCoordinator, BackupReport, BackupRequest};
pub use restore::{RestoreOrchestrator, RestoreOutcome, RestoreReport, RestoreRequest};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
