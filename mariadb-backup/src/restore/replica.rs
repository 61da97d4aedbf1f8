//! Replica handshake: stop, reset, point at the source, start.

use crate::config::ReplicationConfig;
use crate::engine::{quote_literal, DatabaseEngine, EngineError, QueryResult};
use crate::utils::errors::{BackupError, ReplicationFailure, Result};
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

/// Server error raised when the source no longer has the requested log.
pub const ER_SOURCE_FATAL_READING_BINLOG: u32 = 1236;

/// Connection parameters of the replication source.
#[derive(Clone, PartialEq, Eq)]
pub struct ReplicationSource {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for ReplicationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationSource")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

impl ReplicationSource {
    /// Source from the `[replication]` section; `None` when no host is set.
    pub fn from_config(config: &ReplicationConfig) -> Option<Self> {
        if config.master_host.trim().is_empty() {
            return None;
        }
        Some(Self {
            host: config.master_host.trim().to_string(),
            port: config.master_port,
            user: config.master_user.clone(),
            password: config.master_password.clone(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(BackupError::Config("replication source host is required".into()));
        }
        if self.user.is_empty() || self.password.is_empty() {
            return Err(BackupError::Config(
                "replication source user and password are required".into(),
            ));
        }
        Ok(())
    }
}

pub fn change_master_sql(source: &ReplicationSource, log_file: &str, log_position: u64) -> String {
    format!(
        "CHANGE MASTER TO MASTER_HOST={}, MASTER_PORT={}, MASTER_USER={}, MASTER_PASSWORD={}, MASTER_LOG_FILE={}, MASTER_LOG_POS={}",
        quote_literal(&source.host),
        source.port,
        quote_literal(&source.user),
        quote_literal(&source.password),
        quote_literal(log_file),
        log_position,
    )
}

/// Map a server error message to the operator-facing failure reason.
pub fn classify(message: &str) -> ReplicationFailure {
    let lower = message.to_ascii_lowercase();
    if lower.contains("1236")
        || lower.contains("could not find first log file")
        || lower.contains("purged")
        || lower.contains("binary log index")
    {
        ReplicationFailure::CoordinatesUnavailable
    } else if lower.contains("1045") || lower.contains("access denied") {
        ReplicationFailure::CredentialsRejected
    } else if lower.contains("2003")
        || lower.contains("2005")
        || lower.contains("can't connect")
        || lower.contains("unknown server host")
    {
        ReplicationFailure::SourceUnreachable
    } else {
        ReplicationFailure::Rejected
    }
}

fn config_failed(e: &EngineError) -> BackupError {
    let message = e.stderr().map(str::to_string).unwrap_or_else(|| e.to_string());
    BackupError::ReplicationConfigFailed {
        reason: classify(&message),
        message,
    }
}

/// Run the handshake in order. Stop and reset are idempotent, so their
/// failures are only logged.
pub async fn configure(
    engine: &dyn DatabaseEngine,
    source: &ReplicationSource,
    log_file: &str,
    log_position: u64,
) -> Result<()> {
    for statement in ["STOP SLAVE", "RESET SLAVE ALL"] {
        if let Err(e) = engine.execute(statement).await {
            warn!(statement, error = %e, "Ignoring failure");
        }
    }

    engine
        .execute(&change_master_sql(source, log_file, log_position))
        .await
        .map_err(|e| config_failed(&e))?;
    engine.execute("START SLAVE").await.map_err(|e| config_failed(&e))?;

    info!(
        source = %format!("{}:{}", source.host, source.port),
        log_file,
        log_position,
        "Replication started"
    );
    Ok(())
}

/// Replication thread state read from `SHOW SLAVE STATUS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaHealth {
    pub io_running: String,
    pub sql_running: String,
    pub last_io_errno: Option<u32>,
    pub last_io_error: Option<String>,
    pub last_sql_error: Option<String>,
    pub seconds_behind: Option<u64>,
}

impl ReplicaHealth {
    /// `None` when the server reports no replication configuration.
    pub fn from_status(status: &QueryResult) -> Option<Self> {
        if status.is_empty() {
            return None;
        }
        let text = |names: &[&str]| {
            status
                .first_of(names)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Some(Self {
            io_running: text(&["Slave_IO_Running", "Replica_IO_Running"]).unwrap_or_else(|| "No".into()),
            sql_running: text(&["Slave_SQL_Running", "Replica_SQL_Running"]).unwrap_or_else(|| "No".into()),
            last_io_errno: text(&["Last_IO_Errno"]).and_then(|v| v.parse().ok()).filter(|n| *n != 0),
            last_io_error: text(&["Last_IO_Error"]),
            last_sql_error: text(&["Last_SQL_Error"]),
            seconds_behind: text(&["Seconds_Behind_Master", "Seconds_Behind_Source"]).and_then(|v| v.parse().ok()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.io_running.eq_ignore_ascii_case("yes") && self.sql_running.eq_ignore_ascii_case("yes")
    }

    /// The IO thread stopped because the source lacks the requested log.
    pub fn source_missing_log(&self) -> bool {
        self.last_io_errno == Some(ER_SOURCE_FATAL_READING_BINLOG)
    }

    pub fn summary(&self) -> String {
        let mut text = format!("IO thread: {}, SQL thread: {}", self.io_running, self.sql_running);
        if let Some(err) = &self.last_io_error {
            text.push_str(&format!("; IO error: {err}"));
        }
        if let Some(err) = &self.last_sql_error {
            text.push_str(&format!("; SQL error: {err}"));
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FakeEngine;

    fn source() -> ReplicationSource {
        ReplicationSource {
            host: "db-primary".into(),
            port: 3307,
            user: "repl".into(),
            password: "s3cr'et".into(),
        }
    }

    #[test]
    fn test_change_master_is_quoted() {
        let sql = change_master_sql(&source(), "mysql-bin.000003", 1234);
        assert_eq!(
            sql,
            "CHANGE MASTER TO MASTER_HOST='db-primary', MASTER_PORT=3307, MASTER_USER='repl', \
             MASTER_PASSWORD='s3cr''et', MASTER_LOG_FILE='mysql-bin.000003', MASTER_LOG_POS=1234"
        );
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify("ERROR 1236 (HY000): Could not find first log file name in binary log index file"),
            ReplicationFailure::CoordinatesUnavailable
        );
        assert_eq!(
            classify("ERROR 1045 (28000): Access denied for user 'repl'@'10.0.0.5'"),
            ReplicationFailure::CredentialsRejected
        );
        assert_eq!(
            classify("ERROR 2003 (HY000): Can't connect to MySQL server on 'db-primary'"),
            ReplicationFailure::SourceUnreachable
        );
        assert_eq!(classify("ERROR 1198: This operation cannot be performed"), ReplicationFailure::Rejected);
    }

    #[tokio::test]
    async fn test_handshake_order() {
        let engine = FakeEngine::new().rejecting("STOP SLAVE", "ERROR 1199: Slave not running");
        configure(&engine, &source(), "mysql-bin.000003", 1234).await.unwrap();

        let executed = engine.executed();
        assert_eq!(executed.len(), 4);
        assert_eq!(executed[0], "STOP SLAVE");
        assert_eq!(executed[1], "RESET SLAVE ALL");
        assert!(executed[2].starts_with("CHANGE MASTER TO MASTER_HOST='db-primary'"));
        assert_eq!(executed[3], "START SLAVE");
    }

    #[tokio::test]
    async fn test_rejected_change_master_is_classified() {
        let engine = FakeEngine::new().rejecting("CHANGE MASTER", "ERROR 1045 (28000): Access denied");
        let err = configure(&engine, &source(), "mysql-bin.000003", 1234).await.unwrap_err();
        assert!(matches!(
            err,
            BackupError::ReplicationConfigFailed {
                reason: ReplicationFailure::CredentialsRejected,
                ..
            }
        ));
        assert!(!engine.executed().contains(&"START SLAVE".to_string()));
    }

    #[test]
    fn test_health_from_status() {
        let status = QueryResult::new(
            &["Replica_IO_Running", "Replica_SQL_Running", "Last_IO_Errno", "Last_IO_Error", "Seconds_Behind_Source"],
            vec![vec!["No".into(), "Yes".into(), "1236".into(), "purged".into(), "NULL".into()]],
        );
        let health = ReplicaHealth::from_status(&status).unwrap();
        assert!(!health.is_running());
        assert!(health.source_missing_log());
        assert_eq!(health.seconds_behind, None);

        assert!(ReplicaHealth::from_status(&QueryResult::default()).is_none());
    }

    #[test]
    fn test_source_from_config() {
        let mut config = ReplicationConfig::default();
        assert!(ReplicationSource::from_config(&config).is_none());
        config.master_host = "db-primary".into();
        config.master_user = "repl".into();
        let source = ReplicationSource::from_config(&config).unwrap();
        assert_eq!(source.port, 3306);
        assert!(source.validate().is_err());

        config.master_password = "hunter2".into();
        let source = ReplicationSource::from_config(&config).unwrap();
        assert!(source.validate().is_ok());
        assert!(!format!("{source:?}").contains("hunter2"));
    }
}
