//! Dump Engine Adapter.
//!
//! Runs the full export and the user/grant export, each into its own
//! component file through the configured compression and encryption stages.
//! A failed data export is fatal to the job; a failed user export only
//! degrades the artifact.

use super::checkpoint::parse_dump_coordinates;
use crate::artifact::manifest::{ComponentKind, ProducedComponent};
use crate::engine::{quote_literal, DatabaseEngine};
use crate::transfer::{ComponentWriter, StreamOptions};
use crate::utils::errors::{BackupError, Result};
use chrono::Utc;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

/// How much of the dump head is kept for coordinate parsing.
const HEAD_LIMIT: usize = 64 * 1024;

/// Accounts that ship with the server and are never exported.
pub const SYSTEM_ACCOUNTS: &[&str] = &[
    "mysql.sys",
    "mariadb.sys",
    "mysql.infoschema",
    "mysql.session",
];

/// Pass-through writer that keeps a copy of the first bytes written.
pub struct HeadTap<'a> {
    inner: &'a mut (dyn AsyncWrite + Unpin + Send),
    head: Vec<u8>,
    limit: usize,
}

impl<'a> HeadTap<'a> {
    pub fn new(inner: &'a mut (dyn AsyncWrite + Unpin + Send), limit: usize) -> Self {
        Self {
            inner,
            head: Vec::new(),
            limit,
        }
    }

    pub fn into_head(self) -> Vec<u8> {
        self.head
    }
}

impl AsyncWrite for HeadTap<'_> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut *this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &polled {
            let room = this.limit.saturating_sub(this.head.len());
            this.head.extend_from_slice(&buf[..(*written).min(room)]);
        }
        polled
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Result of a successful data export.
#[derive(Debug)]
pub struct DataDump {
    pub component: ProducedComponent,
    /// Coordinates the dump tool recorded at its snapshot point
    pub coordinates: Option<(String, u64)>,
    pub bytes: u64,
}

pub struct DumpAdapter<'a> {
    engine: &'a dyn DatabaseEngine,
    options: &'a StreamOptions,
}

impl<'a> DumpAdapter<'a> {
    pub fn new(engine: &'a dyn DatabaseEngine, options: &'a StreamOptions) -> Self {
        Self { engine, options }
    }

    fn component_name(&self, kind: ComponentKind) -> String {
        self.options.encoding().file_name(kind.base_name())
    }

    /// Export every schema into `dir`. Coordinates are only requested from a
    /// server that has binary logging on. Any failure, including a failed
    /// flush of the encoding stages, is `DumpFailed` with the tool output
    /// attached.
    pub async fn dump_data(&self, dir: &Path, embed_coordinates: bool) -> Result<DataDump> {
        let name = self.component_name(ComponentKind::Data);
        let path = dir.join(&name);

        let mut writer = ComponentWriter::create(&path, self.options)
            .await
            .map_err(|e| BackupError::DumpFailed(format!("cannot open {}: {e}", path.display())))?;

        let mut tap = HeadTap::new(writer.sink(), HEAD_LIMIT);
        let exported = self.engine.export_all(embed_coordinates, &mut tap).await;
        let head = tap.into_head();

        let report = match exported {
            Ok(report) => report,
            Err(e) => {
                // Dropping the writer also stops a running cipher
                drop(writer);
                return Err(BackupError::DumpFailed(e.to_string()));
            }
        };

        writer
            .finish()
            .await
            .map_err(|e| BackupError::DumpFailed(format!("cannot finalize {name}: {e}")))?;

        let stderr = report.stderr.trim().to_string();
        if !stderr.is_empty() {
            warn!(stderr = %stderr, "Dump tool reported warnings");
        }
        info!(bytes = report.bytes, component = %name, "Data export completed");

        Ok(DataDump {
            component: ProducedComponent {
                kind: ComponentKind::Data,
                relative_path: name,
                encoding: self.options.encoding(),
                error: None,
                stderr,
            },
            coordinates: parse_dump_coordinates(&head),
            bytes: report.bytes,
        })
    }

    /// Export accounts and their grants as replayable statements. Never
    /// returns an error: a failure is recorded on the component instead and
    /// any partial file is removed.
    pub async fn export_users(&self, dir: &Path) -> ProducedComponent {
        let name = self.component_name(ComponentKind::Users);
        let path = dir.join(&name);

        let (error, stderr) = match self.write_users(&path).await {
            Ok((count, skipped)) => {
                if skipped.is_empty() {
                    info!(accounts = count, component = %name, "User export completed");
                } else {
                    warn!(accounts = count, stderr = %skipped, "User export skipped accounts");
                }
                (None, skipped)
            }
            Err(e) => {
                warn!(error = %e, "User export failed; artifact will lack accounts");
                if let Err(rm) = tokio::fs::remove_file(&path).await {
                    if rm.kind() != io::ErrorKind::NotFound {
                        warn!(path = %path.display(), error = %rm, "Could not remove partial user export");
                    }
                }
                let stderr = match &e {
                    BackupError::Engine(engine) => engine.stderr().unwrap_or_default().to_string(),
                    _ => String::new(),
                };
                (Some(e.to_string()), stderr)
            }
        };

        ProducedComponent {
            kind: ComponentKind::Users,
            relative_path: name,
            encoding: self.options.encoding(),
            error,
            stderr,
        }
    }

    /// Returns the number of accounts listed and the errors of accounts that
    /// could not be read (dropped while the export ran, for instance).
    async fn write_users(&self, path: &Path) -> Result<(usize, String)> {
        let excluded = SYSTEM_ACCOUNTS
            .iter()
            .map(|a| quote_literal(a))
            .collect::<Vec<_>>()
            .join(", ");
        let listing = format!("SELECT DISTINCT User, Host FROM mysql.user WHERE User NOT IN ({excluded})");

        // The account list and every SHOW run in one snapshot.
        let output = self.engine.snapshot_script(&listing, &account_statements).await?;
        let statements = output.lines;

        let mut writer = ComponentWriter::create(path, self.options).await?;
        let sink = writer.sink();
        sink.write_all(
            format!(
                "-- Users and Grants Backup\n-- Created: {}\n\n",
                Utc::now().to_rfc3339()
            )
            .as_bytes(),
        )
        .await?;
        for statement in statements.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            sink.write_all(statement.trim_end_matches(';').as_bytes()).await?;
            sink.write_all(b";\n").await?;
        }
        writer.finish().await?;

        Ok((output.rows.len(), output.stderr.trim().to_string()))
    }
}

/// `SHOW CREATE USER` and `SHOW GRANTS` for every listed `(user, host)` row.
pub fn account_statements(rows: &[Vec<String>]) -> String {
    rows.iter()
        .filter_map(|row| match row.as_slice() {
            [user, host, ..] => Some(format!("{}@{}", quote_literal(user), quote_literal(host))),
            _ => None,
        })
        .map(|account| format!("SHOW CREATE USER {account};\nSHOW GRANTS FOR {account};\n"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FakeEngine;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_dump_data_captures_coordinates() {
        let dir = TempDir::new().unwrap();
        let engine = FakeEngine::new();
        let options = StreamOptions::plain();

        let dump = DumpAdapter::new(&engine, &options)
            .dump_data(dir.path(), true)
            .await
            .unwrap();

        assert_eq!(dump.component.relative_path, "all_databases.sql");
        assert_eq!(dump.coordinates, Some(("mysql-bin.000003".to_string(), 1234)));
        let text = std::fs::read_to_string(dir.path().join("all_databases.sql")).unwrap();
        assert!(text.contains("CREATE DATABASE shop;"));
        assert_eq!(dump.bytes, text.len() as u64);
    }

    #[tokio::test]
    async fn test_dump_failure_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let engine = FakeEngine::new().with_dump_failure("mysqldump: Got error: 1045: Access denied");
        let options = StreamOptions::plain();

        let err = DumpAdapter::new(&engine, &options)
            .dump_data(dir.path(), true)
            .await
            .unwrap_err();

        match err {
            BackupError::DumpFailed(message) => assert!(message.contains("Access denied")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_export_users_writes_statements() {
        let dir = TempDir::new().unwrap();
        let engine = FakeEngine::new();
        let options = StreamOptions::plain();

        let component = DumpAdapter::new(&engine, &options)
            .export_users(dir.path())
            .await;

        assert!(component.succeeded());
        assert!(component.stderr.is_empty());
        let text = std::fs::read_to_string(dir.path().join("users_and_grants.sql")).unwrap();
        assert!(text.starts_with("-- Users and Grants Backup"));
        assert!(text.contains("CREATE USER `app`@`%` IDENTIFIED BY PASSWORD"));
        assert!(text.contains("GRANT ALL PRIVILEGES ON `shop`.* TO `app`@`%`;\n"));
    }

    #[tokio::test]
    async fn test_export_users_failure_is_recorded() {
        let dir = TempDir::new().unwrap();
        let engine = FakeEngine::new().with_user_export_failure("ERROR 1142: SELECT command denied");
        let options = StreamOptions::plain();

        let component = DumpAdapter::new(&engine, &options)
            .export_users(dir.path())
            .await;

        assert!(!component.succeeded());
        assert!(component.stderr.contains("SELECT command denied"));
        assert!(!dir.path().join("users_and_grants.sql").exists());
    }

    #[tokio::test]
    async fn test_dump_without_binlog_has_no_coordinates() {
        let dir = TempDir::new().unwrap();
        let engine = FakeEngine::new().without_binlog();
        let options = StreamOptions::plain();

        let dump = DumpAdapter::new(&engine, &options)
            .dump_data(dir.path(), false)
            .await
            .unwrap();
        assert_eq!(dump.coordinates, None);
        assert_eq!(engine.dumps.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_account_is_skipped() {
        let dir = TempDir::new().unwrap();
        let mut engine = FakeEngine::new().with_dropped_account("gone");
        engine.users.push(("gone".to_string(), "10.0.0.%".to_string()));
        engine.users.push(("report".to_string(), "localhost".to_string()));
        let options = StreamOptions::plain();

        let component = DumpAdapter::new(&engine, &options)
            .export_users(dir.path())
            .await;

        assert!(component.succeeded());
        assert!(component.stderr.contains("'gone'@'10.0.0.%'"));
        let text = std::fs::read_to_string(dir.path().join("users_and_grants.sql")).unwrap();
        assert!(text.contains("CREATE USER `app`@`%`"));
        assert!(text.contains("CREATE USER `report`@`localhost`"));
        assert!(!text.contains("`gone`"));
    }

    #[test]
    fn test_account_statements_quote_names() {
        let rows = vec![
            vec!["o'brien".to_string(), "%".to_string()],
            vec!["short".to_string()],
        ];
        assert_eq!(
            account_statements(&rows),
            "SHOW CREATE USER 'o''brien'@'%';\nSHOW GRANTS FOR 'o''brien'@'%';\n"
        );
    }

    #[tokio::test]
    async fn test_head_tap_limit() {
        let mut out: Vec<u8> = Vec::new();
        let mut tap = HeadTap::new(&mut out, 4);
        tap.write_all(b"abcdefgh").await.unwrap();
        assert_eq!(tap.into_head(), b"abcd");
        assert_eq!(out, b"abcdefgh");
    }
}
