//! [`DatabaseEngine`] backed by the `mysql` and `mysqldump` client binaries.

use super::{quote_literal, unescape_batch, DatabaseEngine, EngineError, QueryResult, SessionOutput, ToolReport};
use crate::config::MysqlConfig;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// `mysqldump` flags for a full, single-snapshot export.
pub const DUMP_OPTIONS: &[&str] = &[
    "--all-databases",
    "--single-transaction",
    "--routines",
    "--triggers",
    "--events",
    "--flush-privileges",
    "--hex-blob",
    "--add-drop-database",
    "--quick",
];

/// Writes the snapshot's coordinates as a commented `CHANGE MASTER TO`.
/// `mysqldump` refuses it when binary logging is off.
pub const COORDINATES_OPTION: &str = "--master-data=2";

/// Row the session script selects to mark the end of the listing output.
const LISTING_END: &str = "mariadb-backup:listing-end";

/// Dump flags for one export.
pub fn dump_args(embed_coordinates: bool) -> Vec<&'static str> {
    let mut args = DUMP_OPTIONS.to_vec();
    if embed_coordinates {
        args.push(COORDINATES_OPTION);
    }
    args
}

#[derive(Debug, Clone)]
pub struct MysqlCli {
    settings: MysqlConfig,
}

impl MysqlCli {
    pub fn new(settings: MysqlConfig) -> Self {
        Self { settings }
    }

    /// Connection flags. The password travels in `MYSQL_PWD`, never argv.
    fn connection_args(&self) -> Vec<String> {
        let mut args = vec![format!("--user={}", self.settings.user)];
        match &self.settings.socket {
            Some(socket) => args.push(format!("--socket={}", socket.display())),
            None => {
                args.push(format!("--host={}", self.settings.host));
                args.push(format!("--port={}", self.settings.port));
            }
        }
        args
    }

    fn command(&self, bin: &Path) -> Command {
        let mut cmd = Command::new(bin);
        cmd.args(self.connection_args())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if !self.settings.password.is_empty() {
            cmd.env("MYSQL_PWD", &self.settings.password);
        }
        cmd
    }

    fn client(&self) -> Command {
        self.command(&self.settings.mysql_bin)
    }

    fn tool_name(bin: &Path) -> String {
        bin.display().to_string()
    }

    /// Run to completion and return stdout.
    async fn capture(&self, mut cmd: Command) -> Result<String, EngineError> {
        let tool = Self::tool_name(&self.settings.mysql_bin);
        let output = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                tool: tool.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(EngineError::ToolFailed {
                tool,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).trim().to_string()
}

#[async_trait]
impl DatabaseEngine for MysqlCli {
    fn describe(&self) -> String {
        match &self.settings.socket {
            Some(socket) => format!("{}@{}", self.settings.user, socket.display()),
            None => format!(
                "{}@{}:{}",
                self.settings.user, self.settings.host, self.settings.port
            ),
        }
    }

    async fn ping(&self) -> Result<(), EngineError> {
        let mut cmd = self.client();
        cmd.args(["-N", "-B", "-e", "SELECT 1;"]);
        self.capture(cmd).await.map(|_| ())
    }

    async fn export_all(
        &self,
        embed_coordinates: bool,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<ToolReport, EngineError> {
        let tool = Self::tool_name(&self.settings.mysqldump_bin);
        let mut child = self
            .command(&self.settings.mysqldump_bin)
            .args(dump_args(embed_coordinates))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EngineError::Spawn {
                tool: tool.clone(),
                source,
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Protocol("dump stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Protocol("dump stderr unavailable".into()))?;
        let stderr_task = tokio::spawn(drain(stderr));

        let copied = tokio::io::copy(&mut stdout, &mut *sink).await;
        if copied.is_err() {
            // The dump would block on a full pipe otherwise
            let _ = child.start_kill();
        }
        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(EngineError::ToolFailed {
                tool,
                status: status.to_string(),
                stderr,
            });
        }
        let bytes = copied?;
        sink.flush().await?;

        debug!("{} exported {} bytes", tool, bytes);
        Ok(ToolReport { bytes, stderr })
    }

    async fn query(&self, sql: &str) -> Result<QueryResult, EngineError> {
        let mut cmd = self.client();
        cmd.args(["-B", "-e", sql]);
        let out = self.capture(cmd).await?;
        Ok(QueryResult::parse_batch(&out))
    }

    async fn snapshot_script(
        &self,
        listing: &str,
        follow_up: &(dyn for<'r> Fn(&'r [Vec<String>]) -> String + Send + Sync),
    ) -> Result<SessionOutput, EngineError> {
        let tool = Self::tool_name(&self.settings.mysql_bin);
        let mut child = self
            .client()
            .args(["-N", "-B", "--force", "--unbuffered"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EngineError::Spawn {
                tool: tool.clone(),
                source,
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Protocol("client stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Protocol("client stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Protocol("client stderr unavailable".into()))?;
        let stderr_task = tokio::spawn(drain(stderr));
        let mut output = BufReader::new(stdout).lines();

        let opening = format!(
            "START TRANSACTION WITH CONSISTENT SNAPSHOT;\n{};\nSELECT {};\n",
            listing.trim().trim_end_matches(';'),
            quote_literal(LISTING_END)
        );
        // A client that failed to connect has closed its stdin; its exit
        // status and stderr are reported below.
        if let Err(e) = stdin.write_all(opening.as_bytes()).await {
            debug!(error = %e, "Session input closed early");
        }

        // The follow-up depends on the listing, so read up to the marker
        // before writing anything else into the session.
        let mut rows = Vec::new();
        loop {
            match output.next_line().await? {
                Some(line) if line == LISTING_END => break,
                Some(line) => rows.push(line.split('\t').map(unescape_batch).collect::<Vec<_>>()),
                None => {
                    drop(stdin);
                    let status = child.wait().await?;
                    return Err(EngineError::ToolFailed {
                        tool,
                        status: status.to_string(),
                        stderr: stderr_task.await.unwrap_or_default(),
                    });
                }
            }
        }

        let script = format!("{}COMMIT;\n", follow_up(&rows));
        let write = async move {
            stdin.write_all(script.as_bytes()).await?;
            stdin.shutdown().await
        };
        let read = async {
            let mut lines = Vec::new();
            while let Some(line) = output.next_line().await? {
                if !line.trim().is_empty() {
                    lines.push(unescape_batch(line.split('\t').next().unwrap_or(&line)));
                }
            }
            Ok::<_, std::io::Error>(lines)
        };
        let (written, lines) = tokio::join!(write, read);
        let lines = lines?;
        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        written?;

        // With --force a failed statement only shows up in the exit status.
        if !status.success() {
            if rows.is_empty() && lines.is_empty() {
                return Err(EngineError::ToolFailed {
                    tool,
                    status: status.to_string(),
                    stderr,
                });
            }
            warn!(tool = %tool, stderr = %stderr, "Session script skipped failing statements");
        }
        Ok(SessionOutput { rows, lines, stderr })
    }

    async fn execute(&self, sql: &str) -> Result<(), EngineError> {
        let mut cmd = self.client();
        cmd.args(["-e", sql]);
        self.capture(cmd).await.map(|_| ())
    }

    async fn import(
        &self,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<ToolReport, EngineError> {
        let tool = Self::tool_name(&self.settings.mysql_bin);
        let mut child = self
            .client()
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EngineError::Spawn {
                tool: tool.clone(),
                source,
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Protocol("client stdin unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Protocol("client stderr unavailable".into()))?;
        let stderr_task = tokio::spawn(drain(stderr));

        let copied = tokio::io::copy(&mut *source, &mut stdin).await;
        drop(stdin);
        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(EngineError::ToolFailed {
                tool,
                status: status.to_string(),
                stderr,
            });
        }
        let bytes = copied?;
        Ok(ToolReport { bytes, stderr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_connection_args_keep_password_out_of_argv() {
        let cli = MysqlCli::new(MysqlConfig {
            password: "s3cret".into(),
            ..MysqlConfig::default()
        });
        let args = cli.connection_args();
        assert_eq!(args, vec!["--user=root", "--host=localhost", "--port=3306"]);
        assert!(args.iter().all(|a| !a.contains("s3cret")));
    }

    #[test]
    fn test_socket_replaces_host_and_port() {
        let cli = MysqlCli::new(MysqlConfig {
            socket: Some(PathBuf::from("/run/mysqld/mysqld.sock")),
            ..MysqlConfig::default()
        });
        assert_eq!(
            cli.connection_args(),
            vec!["--user=root", "--socket=/run/mysqld/mysqld.sock"]
        );
        assert_eq!(cli.describe(), "root@/run/mysqld/mysqld.sock");
    }

    #[test]
    fn test_dump_is_single_snapshot() {
        assert!(DUMP_OPTIONS.contains(&"--single-transaction"));
        assert!(DUMP_OPTIONS.contains(&"--all-databases"));
        assert!(!DUMP_OPTIONS.contains(&COORDINATES_OPTION));
    }

    // `echo` stands in for mysqldump and writes its argv into the sink.
    async fn dump_argv(embed_coordinates: bool) -> String {
        let cli = MysqlCli::new(MysqlConfig {
            mysqldump_bin: PathBuf::from("echo"),
            ..MysqlConfig::default()
        });
        let mut sink: Vec<u8> = Vec::new();
        let report = cli.export_all(embed_coordinates, &mut sink).await.unwrap();
        assert_eq!(report.bytes, sink.len() as u64);
        String::from_utf8(sink).unwrap()
    }

    #[tokio::test]
    async fn test_coordinates_flag_follows_binlog_state() {
        let with_binlog = dump_argv(true).await;
        assert!(with_binlog.contains("--single-transaction"));
        assert!(with_binlog.contains("--master-data=2"));

        let without_binlog = dump_argv(false).await;
        assert!(without_binlog.contains("--single-transaction"));
        assert!(!without_binlog.contains("--master-data"));
    }

    #[tokio::test]
    async fn test_missing_binary_reports_spawn_error() {
        let cli = MysqlCli::new(MysqlConfig {
            mysql_bin: PathBuf::from("/nonexistent/mysql"),
            ..MysqlConfig::default()
        });
        let err = cli.ping().await.expect_err("binary is missing");
        assert!(matches!(err, EngineError::Spawn { .. }));
    }
}
