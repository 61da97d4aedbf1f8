//! Scripted in-memory engine for tests.

use super::{DatabaseEngine, EngineError, QueryResult, SessionOutput, ToolReport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub struct FakeEngine {
    pub unreachable: bool,
    pub master_status: Option<(String, u64)>,
    /// Coordinates embedded in the dump head
    pub dump_coordinates: Option<(String, u64)>,
    pub dump_body: String,
    pub dump_failure: Option<String>,
    pub users: Vec<(String, String)>,
    pub user_export_failure: Option<String>,
    /// Accounts listed but gone by the time they are read
    pub dropped_accounts: Vec<String>,
    /// Imports containing the marker fail with the message
    pub import_failure: Option<(String, String)>,
    /// Statements starting with the prefix fail with the message
    pub rejections: Vec<(String, String)>,
    pub replica_status: Option<QueryResult>,
    pub gate: Option<Arc<Notify>>,
    /// Cancel the token and stall once an import contains the marker
    pub cancel_on_import: Option<(String, CancellationToken)>,
    pub entered: Arc<Notify>,
    pub dumps: AtomicUsize,
    executed: Mutex<Vec<String>>,
    imported: Mutex<Vec<String>>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn tool_failed(tool: &str, stderr: &str) -> EngineError {
    EngineError::ToolFailed {
        tool: tool.to_string(),
        status: "exit status: 1".to_string(),
        stderr: stderr.to_string(),
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        let coordinates = Some(("mysql-bin.000003".to_string(), 1234));
        Self {
            unreachable: false,
            master_status: Some(("mysql-bin.000003".to_string(), 1200)),
            dump_coordinates: coordinates,
            dump_body: "CREATE DATABASE shop;\nINSERT INTO shop.t VALUES (1);\n".to_string(),
            dump_failure: None,
            users: vec![("app".to_string(), "%".to_string())],
            user_export_failure: None,
            dropped_accounts: Vec::new(),
            import_failure: None,
            rejections: Vec::new(),
            replica_status: None,
            gate: None,
            cancel_on_import: None,
            entered: Arc::new(Notify::new()),
            dumps: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
            imported: Mutex::new(Vec::new()),
        }
    }

    /// Fail every connection attempt.
    pub fn offline(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn without_binlog(mut self) -> Self {
        self.master_status = None;
        self.dump_coordinates = None;
        self
    }

    pub fn with_dump_failure(mut self, stderr: &str) -> Self {
        self.dump_failure = Some(stderr.to_string());
        self
    }

    pub fn with_user_export_failure(mut self, stderr: &str) -> Self {
        self.user_export_failure = Some(stderr.to_string());
        self
    }

    pub fn with_dropped_account(mut self, user: &str) -> Self {
        self.dropped_accounts.push(user.to_string());
        self
    }

    pub fn cancelling_on_import(mut self, marker: &str, token: CancellationToken) -> Self {
        self.cancel_on_import = Some((marker.to_string(), token));
        self
    }

    pub fn with_import_failure(mut self, marker: &str, stderr: &str) -> Self {
        self.import_failure = Some((marker.to_string(), stderr.to_string()));
        self
    }

    pub fn rejecting(mut self, prefix: &str, stderr: &str) -> Self {
        self.rejections.push((prefix.to_string(), stderr.to_string()));
        self
    }

    pub fn with_replica_status(mut self, io: &str, sql: &str, io_errno: u32, io_error: &str) -> Self {
        self.replica_status = Some(QueryResult::new(
            &["Slave_IO_Running", "Slave_SQL_Running", "Last_IO_Errno", "Last_IO_Error", "Last_SQL_Error"],
            vec![vec![
                io.to_string(),
                sql.to_string(),
                io_errno.to_string(),
                io_error.to_string(),
                String::new(),
            ]],
        ));
        self
    }

    /// Block every export until `gate` is notified.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn imported(&self) -> Vec<String> {
        self.imported.lock().map(|v| v.clone()).unwrap_or_default()
    }

    fn dump_text(&self, embed_coordinates: bool) -> String {
        let mut text = String::from("-- MariaDB dump 10.19  Distrib 10.11.6-MariaDB\n--\n");
        if let Some((file, pos)) = self.dump_coordinates.as_ref().filter(|_| embed_coordinates) {
            text.push_str("-- Position to start replication or point-in-time recovery from\n--\n\n");
            text.push_str(&format!(
                "-- CHANGE MASTER TO MASTER_LOG_FILE='{file}', MASTER_LOG_POS={pos};\n\n"
            ));
        }
        text.push_str(&self.dump_body);
        text
    }
}

#[async_trait]
impl DatabaseEngine for FakeEngine {
    fn describe(&self) -> String {
        "fake@test".to_string()
    }

    async fn ping(&self) -> Result<(), EngineError> {
        if self.unreachable {
            return Err(tool_failed("mysql", "ERROR 2002 (HY000): Can't connect to local server"));
        }
        Ok(())
    }

    async fn export_all(
        &self,
        embed_coordinates: bool,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<ToolReport, EngineError> {
        self.dumps.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        if embed_coordinates && self.master_status.is_none() {
            return Err(tool_failed(
                "mysqldump",
                "mysqldump: Error: Binlogging on server not active",
            ));
        }

        if let Some(stderr) = &self.dump_failure {
            sink.write_all(b"-- MariaDB dump 10.19\n").await?;
            return Err(tool_failed("mysqldump", stderr));
        }

        let text = self.dump_text(embed_coordinates);
        sink.write_all(text.as_bytes()).await?;
        sink.flush().await?;
        Ok(ToolReport {
            bytes: text.len() as u64,
            stderr: String::new(),
        })
    }

    async fn query(&self, sql: &str) -> Result<QueryResult, EngineError> {
        if sql.contains("SHOW MASTER STATUS") {
            let columns = ["File", "Position", "Binlog_Do_DB", "Binlog_Ignore_DB"];
            let rows = match &self.master_status {
                Some((file, pos)) => vec![vec![file.clone(), pos.to_string(), String::new(), String::new()]],
                None => Vec::new(),
            };
            return Ok(QueryResult::new(&columns, rows));
        }
        if sql.contains("@@server_uuid") {
            return Err(tool_failed("mysql", "ERROR 1193 (HY000): Unknown system variable 'server_uuid'"));
        }
        if sql.contains("@@server_id") {
            return Ok(QueryResult::new(
                &["server_id", "hostname"],
                vec![vec!["1".to_string(), "db-primary".to_string()]],
            ));
        }
        if sql.contains("mysql.user") {
            let rows = self
                .users
                .iter()
                .map(|(u, h)| vec![u.clone(), h.clone()])
                .collect();
            return Ok(QueryResult::new(&["user", "host"], rows));
        }
        if sql.contains("SHOW SLAVE STATUS") {
            return Ok(self.replica_status.clone().unwrap_or_default());
        }
        Ok(QueryResult::default())
    }

    async fn snapshot_script(
        &self,
        listing: &str,
        follow_up: &(dyn for<'r> Fn(&'r [Vec<String>]) -> String + Send + Sync),
    ) -> Result<SessionOutput, EngineError> {
        if let Some(stderr) = &self.user_export_failure {
            return Err(tool_failed("mysql", stderr));
        }
        let rows: Vec<Vec<String>> = if listing.contains("mysql.user") {
            self.users
                .iter()
                .map(|(u, h)| vec![u.clone(), h.clone()])
                .collect()
        } else {
            Vec::new()
        };

        let script = follow_up(&rows);
        let mut output = SessionOutput {
            rows,
            ..SessionOutput::default()
        };
        for (user, host) in &self.users {
            let account = format!("'{user}'@'{host}'");
            if !script.contains(&account) {
                continue;
            }
            if self.dropped_accounts.contains(user) {
                output.stderr.push_str(&format!(
                    "ERROR 1133 (28000) at line 3: Can't find any matching row in the user table for {account}\n"
                ));
                continue;
            }
            output.lines.push(format!(
                "CREATE USER `{user}`@`{host}` IDENTIFIED BY PASSWORD '*2470C0C06DEE42FD1618BB99005ADCA2EC9D1E19'"
            ));
            output.lines.push(format!("GRANT ALL PRIVILEGES ON `shop`.* TO `{user}`@`{host}`"));
        }
        Ok(output)
    }

    async fn execute(&self, sql: &str) -> Result<(), EngineError> {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(sql.to_string());
        }
        let statement = sql.trim_start();
        match self.rejections.iter().find(|(prefix, _)| statement.starts_with(prefix.as_str())) {
            Some((_, stderr)) => Err(tool_failed("mysql", stderr)),
            None => Ok(()),
        }
    }

    async fn import(
        &self,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<ToolReport, EngineError> {
        let mut text = String::new();
        source.read_to_string(&mut text).await?;
        let bytes = text.len() as u64;

        let failure = self
            .import_failure
            .as_ref()
            .filter(|(marker, _)| text.contains(marker.as_str()))
            .map(|(_, stderr)| stderr.clone());
        let stall = self
            .cancel_on_import
            .as_ref()
            .filter(|(marker, _)| text.contains(marker.as_str()));
        if let Ok(mut imported) = self.imported.lock() {
            imported.push(text);
        }
        if let Some((_, token)) = stall {
            token.cancel();
            std::future::pending::<()>().await;
        }

        match failure {
            Some(stderr) => Err(tool_failed("mysql", &stderr)),
            None => Ok(ToolReport {
                bytes,
                stderr: String::new(),
            }),
        }
    }
}
