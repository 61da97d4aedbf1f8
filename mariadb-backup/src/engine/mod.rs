//! Database engine adapter.
//!
//! The core talks to the database only through [`DatabaseEngine`], whose
//! capabilities are: full export, read queries, administrative statements and
//! SQL stream import. [`mysql::MysqlCli`] satisfies it with the stock client
//! binaries; tests use a scripted fake.

pub mod mysql;
#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use mysql::MysqlCli;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("stream error: {0}")]
    Stream(#[from] std::io::Error),

    #[error("unexpected output: {0}")]
    Protocol(String),
}

impl EngineError {
    /// Diagnostic output captured from the external tool, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            EngineError::ToolFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Outcome of a streaming tool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolReport {
    pub bytes: u64,
    /// Captured even on success; dump tools warn there
    pub stderr: String,
}

/// Output of [`DatabaseEngine::snapshot_script`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOutput {
    /// Rows of the listing query
    pub rows: Vec<Vec<String>>,
    /// First column of every follow-up output row
    pub lines: Vec<String>,
    /// Errors of follow-up statements that were skipped
    pub stderr: String,
}

/// Tabular result of a read query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl QueryResult {
    pub fn new(columns: &[&str], rows: Vec<Vec<String>>) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cell by row index and column name (case-insensitive). SQL `NULL` and
    /// missing columns are `None`.
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        let cell = self.rows.get(row)?.get(idx)?;
        (cell != "NULL").then_some(cell.as_str())
    }

    /// First-row cell.
    pub fn first(&self, column: &str) -> Option<&str> {
        self.value(0, column)
    }

    /// First-row cell under any of several column names (renamed across
    /// server versions).
    pub fn first_of(&self, columns: &[&str]) -> Option<&str> {
        columns.iter().find_map(|c| self.first(c))
    }

    /// Parse client batch output: a tab-separated header line followed by rows.
    pub fn parse_batch(output: &str) -> Self {
        let mut lines = output.lines();
        let columns = match lines.next() {
            Some(header) => header.split('\t').map(unescape_batch).collect(),
            None => return Self::default(),
        };
        let rows = lines
            .filter(|l| !l.is_empty())
            .map(|l| l.split('\t').map(unescape_batch).collect())
            .collect();
        Self { columns, rows }
    }
}

/// Undo the client's batch-mode escaping of `\n`, `\t`, `\0` and `\\`.
pub fn unescape_batch(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Quote a string as an SQL literal.
pub fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

#[async_trait]
pub trait DatabaseEngine: Send + Sync {
    /// Human-readable target, for logs.
    fn describe(&self) -> String;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<(), EngineError>;

    /// Consistent single-snapshot export of all schemas, written to `sink`.
    /// With `embed_coordinates` the replication coordinates of the snapshot
    /// are written as a comment in the stream head; a server without binary
    /// logging cannot provide them.
    async fn export_all(
        &self,
        embed_coordinates: bool,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<ToolReport, EngineError>;

    /// Run one read statement and return its result set.
    async fn query(&self, sql: &str) -> Result<QueryResult, EngineError>;

    /// Open a consistent-snapshot transaction, run `listing`, then run the
    /// script `follow_up` builds from the listing's rows in the same session
    /// and snapshot. A failing follow-up statement does not stop the script;
    /// its message is returned in [`SessionOutput::stderr`].
    async fn snapshot_script(
        &self,
        listing: &str,
        follow_up: &(dyn for<'r> Fn(&'r [Vec<String>]) -> String + Send + Sync),
    ) -> Result<SessionOutput, EngineError>;

    /// Run an administrative statement.
    async fn execute(&self, sql: &str) -> Result<(), EngineError>;

    /// Replay an SQL stream.
    async fn import(
        &self,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<ToolReport, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_batch_output() {
        let out = "File\tPosition\tBinlog_Do_DB\tBinlog_Ignore_DB\nmysql-bin.000003\t1234\t\t\n";
        let result = QueryResult::parse_batch(out);
        assert_eq!(result.columns.len(), 4);
        assert_eq!(result.first("file"), Some("mysql-bin.000003"));
        assert_eq!(result.first("Position"), Some("1234"));
        assert_eq!(result.first("Binlog_Do_DB"), Some(""));
        assert_eq!(result.first("missing"), None);

        assert!(QueryResult::parse_batch("").is_empty());
    }

    #[test]
    fn test_null_cells() {
        let result = QueryResult::new(&["Last_IO_Error"], vec![vec!["NULL".into()]]);
        assert_eq!(result.first("Last_IO_Error"), None);
        assert_eq!(
            QueryResult::new(&["Replica_IO_Running"], vec![vec!["Yes".into()]])
                .first_of(&["Slave_IO_Running", "Replica_IO_Running"]),
            Some("Yes")
        );
    }

    #[test]
    fn test_unescape_batch() {
        assert_eq!(unescape_batch(r"a\tb\nc\\d"), "a\tb\nc\\d");
        assert_eq!(unescape_batch(r"plain"), "plain");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("repl"), "'repl'");
        assert_eq!(quote_literal("o'neil\\"), "'o''neil\\\\'");
    }
}
