//! Checkpoint Capturer.
//!
//! Coordinates come from two places: a `SHOW MASTER STATUS` read taken right
//! before the dump starts, and the commented `CHANGE MASTER TO` line the dump
//! tool writes at its snapshot point. The second one is exact, so it wins
//! whenever the dump carries it.

use crate::artifact::manifest::{Checkpoint, CheckpointSource};
use crate::engine::DatabaseEngine;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Read the current log position and server identity. Never fails: a
/// server with binary logging off yields a checkpoint without coordinates.
pub async fn capture(engine: &dyn DatabaseEngine, captured_at: DateTime<Utc>) -> Checkpoint {
    let mut checkpoint = Checkpoint::unavailable(captured_at);

    match engine.query("SHOW MASTER STATUS").await {
        Ok(status) if !status.is_empty() => {
            checkpoint.log_file = status.first("File").map(str::to_string);
            checkpoint.log_position = status.first("Position").and_then(|p| p.parse().ok());
            checkpoint.binlog_do_db = non_empty(status.first("Binlog_Do_DB"));
            checkpoint.binlog_ignore_db = non_empty(status.first("Binlog_Ignore_DB"));
            if checkpoint.has_coordinates() {
                checkpoint.source = CheckpointSource::MasterStatus;
            }
        }
        Ok(_) => info!("Binary logging is disabled; backup will not be replica-capable"),
        Err(e) => warn!(error = %e, "Could not read master status"),
    }

    match engine
        .query("SELECT @@server_id AS server_id, @@hostname AS hostname")
        .await
    {
        Ok(identity) => {
            checkpoint.server_id = identity.first("server_id").map(str::to_string);
            checkpoint.server_identity = identity.first("hostname").map(str::to_string);
        }
        Err(e) => warn!(error = %e, "Could not read server identity"),
    }

    // MySQL exposes a stable uuid; MariaDB does not have the variable.
    if let Ok(uuid) = engine.query("SELECT @@server_uuid AS server_uuid").await {
        if let Some(value) = non_empty(uuid.first("server_uuid")) {
            checkpoint.server_identity = Some(value);
        }
    }

    checkpoint
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

/// Extract `(log_file, log_position)` from the head of a dump written with
/// `--master-data=2`.
pub fn parse_dump_coordinates(head: &[u8]) -> Option<(String, u64)> {
    let text = String::from_utf8_lossy(head);
    text.lines()
        .filter(|line| line.starts_with("--") || line.starts_with("CHANGE"))
        .filter(|line| line.contains("CHANGE MASTER TO") || line.contains("CHANGE REPLICATION SOURCE TO"))
        .find_map(|line| {
            let file = quoted_value(line, &["MASTER_LOG_FILE=", "SOURCE_LOG_FILE="])?;
            let pos = numeric_value(line, &["MASTER_LOG_POS=", "SOURCE_LOG_POS="])?;
            Some((file, pos))
        })
}

fn quoted_value(line: &str, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        let rest = &line[line.find(key)? + key.len()..];
        let rest = rest.strip_prefix('\'')?;
        let end = rest.find('\'')?;
        Some(rest[..end].to_string())
    })
}

fn numeric_value(line: &str, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| {
        let rest = &line[line.find(key)? + key.len()..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().ok()
    })
}

/// Merge the dump's own coordinates into the pre-read checkpoint.
pub fn reconcile(mut checkpoint: Checkpoint, from_dump: Option<(String, u64)>) -> Checkpoint {
    let Some((file, pos)) = from_dump else {
        return checkpoint;
    };

    if let Some((pre_file, pre_pos)) = checkpoint.coordinates() {
        if pre_file != file || pre_pos != pos {
            debug!(
                pre_read = %format!("{pre_file}:{pre_pos}"),
                snapshot = %format!("{file}:{pos}"),
                "Log position advanced before the dump snapshot"
            );
        }
    }

    checkpoint.log_file = Some(file);
    checkpoint.log_position = Some(pos);
    checkpoint.source = CheckpointSource::DumpHeader;
    checkpoint
}
