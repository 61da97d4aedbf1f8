//! Utility modules for the backup manager.

pub mod errors;
pub mod logger;

pub use errors::{BackupError, ErrorKind, Issue, ReplicationFailure, Result};
