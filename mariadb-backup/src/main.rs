//! MariaDB Backup - Main entry point
//!
//! Checkpointed backup, retention and replica restore for MariaDB.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mariadb_backup::artifact::{ArtifactSummary, RetentionClass, SystemClock};
use mariadb_backup::daemon::shutdown::ShutdownCoordinator;
use mariadb_backup::engine::{DatabaseEngine, MysqlCli};
use mariadb_backup::executor::checkpoint;
use mariadb_backup::restore::{ArtifactRef, ReplicaConfigRequest, ReplicationSource};
use mariadb_backup::retention::RotationReport;
use mariadb_backup::{
    utils, BackupCoordinator, BackupError, BackupReport, BackupRequest, Config, RestoreOrchestrator,
    RestoreOutcome, RestoreReport, RestoreRequest,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

const EXIT_FAILURE: u8 = 1;
const EXIT_PARTIAL: u8 = 3;
const EXIT_ALREADY_RUNNING: u8 = 4;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Print structured results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a backup of the given class (hourly, daily, monthly, manual)
    Backup {
        class: RetentionClass,

        /// Alternative storage root (manual backups only)
        #[arg(long, value_name = "DIR")]
        path: Option<PathBuf>,
    },

    /// List backups, newest first
    List {
        #[arg(long = "type", value_name = "CLASS")]
        class: Option<RetentionClass>,
    },

    /// Restore a backup by id or directory
    Restore {
        artifact: String,

        /// Configure this server as a replica after the data is restored
        #[arg(long)]
        replica: bool,

        #[arg(long, requires = "replica")]
        master_host: Option<String>,

        #[arg(long, requires = "replica")]
        master_port: Option<u16>,

        #[arg(long, requires = "replica")]
        master_user: Option<String>,

        #[arg(long, requires = "replica")]
        master_password: Option<String>,

        /// Do not replay the users and grants export
        #[arg(long)]
        skip_users: bool,

        /// Accept a directory without a manifest or with an incomplete one
        #[arg(long)]
        allow_partial: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Apply the retention policy of a class
    Rotate { class: RetentionClass },

    /// Test the database connection and show the current binlog position
    Check,

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write a default configuration file
    Init {
        #[arg(long, value_name = "FILE")]
        path: Option<PathBuf>,
    },
    /// Print the effective configuration with passwords masked
    Show,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let code = match e.downcast_ref::<BackupError>() {
                Some(BackupError::JobAlreadyRunning { .. }) => EXIT_ALREADY_RUNNING,
                _ => EXIT_FAILURE,
            };
            eprintln!("Error: {:#}", e);
            ExitCode::from(code)
        }
    }
}

async fn run(args: Args) -> Result<u8> {
    if let Command::Config {
        action: ConfigAction::Init { path },
    } = &args.command
    {
        return init_config(path.clone());
    }

    // Load configuration
    let (config, source) = Config::load(args.config.as_deref())?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    match &source {
        Some(path) => tracing::debug!("Using configuration {}", path.display()),
        None => tracing::debug!("No configuration file found, using defaults"),
    }

    let engine: Arc<dyn DatabaseEngine> = Arc::new(MysqlCli::new(config.mysql.clone()));

    // Signals cancel whatever job is running
    let shutdown = ShutdownCoordinator::new().spawn();

    match args.command {
        Command::Backup { class, path } => {
            let mut request = BackupRequest::new(class);
            if let Some(path) = path {
                request = request.with_path(path);
            }
            let coordinator = BackupCoordinator::with_cancel(config, engine, shutdown);
            let report = coordinator.create_backup(request, &SystemClock).await?;
            emit(args.json, &report, print_backup)?;
            Ok(backup_exit_code(&report))
        }
        Command::List { class } => {
            let coordinator = BackupCoordinator::new(config, engine);
            let backups = coordinator.list_backups(class).await?;
            emit(args.json, &backups, |b| print_list(b))?;
            Ok(0)
        }
        Command::Restore {
            artifact,
            replica,
            master_host,
            master_port,
            master_user,
            master_password,
            skip_users,
            allow_partial,
            yes,
        } => {
            let mut request = RestoreRequest::new(ArtifactRef::parse(&artifact));
            request.restore_users = !skip_users;
            request.allow_partial = allow_partial;

            if replica {
                let mut source = ReplicationSource::from_config(&config.replication).unwrap_or(ReplicationSource {
                    host: String::new(),
                    port: config.replication.master_port,
                    user: config.replication.master_user.clone(),
                    password: config.replication.master_password.clone(),
                });
                if let Some(host) = master_host {
                    source.host = host;
                }
                if let Some(port) = master_port {
                    source.port = port;
                }
                if let Some(user) = master_user {
                    source.user = user;
                }
                if let Some(password) = master_password {
                    source.password = password;
                }
                request = request.as_replica(ReplicaConfigRequest {
                    source,
                    checkpoint: None,
                });
            }

            if !yes && !confirm_restore(engine.as_ref(), &request).await? {
                eprintln!("Restore cancelled.");
                return Ok(EXIT_FAILURE);
            }

            let orchestrator = RestoreOrchestrator::with_cancel(config, engine, shutdown);
            let report = orchestrator.restore_backup(request).await?;
            emit(args.json, &report, print_restore)?;
            Ok(match report.outcome {
                RestoreOutcome::Success => 0,
                RestoreOutcome::PartialSuccess => EXIT_PARTIAL,
                RestoreOutcome::Failed => EXIT_FAILURE,
            })
        }
        Command::Rotate { class } => {
            let policy = config.rotation;
            let coordinator = BackupCoordinator::new(config, engine);
            let report = coordinator.apply_retention(class, &policy).await?;
            emit(args.json, &report, print_rotation)?;
            Ok(if report.is_clean() { 0 } else { EXIT_PARTIAL })
        }
        Command::Check => check(engine.as_ref(), args.json).await,
        Command::Config { action } => match action {
            ConfigAction::Show => {
                print!("{}", toml::to_string_pretty(&config.redacted())?);
                Ok(0)
            }
            ConfigAction::Init { .. } => Ok(0),
        },
    }
}

fn init_config(path: Option<PathBuf>) -> Result<u8> {
    let path = path
        .or_else(|| Config::search_locations().pop())
        .context("no configuration location available")?;
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    Config::write_default(&path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(0)
}

fn backup_exit_code(report: &BackupReport) -> u8 {
    if !report.is_complete() {
        EXIT_FAILURE
    } else if report.is_degraded() {
        EXIT_PARTIAL
    } else {
        0
    }
}

async fn confirm_restore(engine: &dyn DatabaseEngine, request: &RestoreRequest) -> Result<bool> {
    eprintln!("WARNING: This will REPLACE all databases on {}", engine.describe());
    if let Some(replica) = &request.replica {
        eprintln!(
            "         and configure it as a replica of {}:{}",
            replica.source.host, replica.source.port
        );
    }
    eprint!("Are you sure you want to continue? (yes/no): ");

    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(line.trim().eq_ignore_ascii_case("yes"))
}

#[derive(Serialize)]
struct CheckResult {
    target: String,
    reachable: bool,
    log_file: Option<String>,
    log_position: Option<u64>,
    server_id: Option<String>,
    error: Option<String>,
}

async fn check(engine: &dyn DatabaseEngine, json: bool) -> Result<u8> {
    let mut result = CheckResult {
        target: engine.describe(),
        reachable: false,
        log_file: None,
        log_position: None,
        server_id: None,
        error: None,
    };

    match engine.ping().await {
        Ok(()) => {
            result.reachable = true;
            let checkpoint = checkpoint::capture(engine, chrono::Utc::now()).await;
            result.log_file = checkpoint.log_file;
            result.log_position = checkpoint.log_position;
            result.server_id = checkpoint.server_id;
        }
        Err(e) => result.error = Some(e.to_string()),
    }

    emit(json, &result, |r| {
        if r.reachable {
            println!("✓ Connected to {}", r.target);
            match (&r.log_file, r.log_position) {
                (Some(file), Some(pos)) => println!("  Binlog position: {file}:{pos}"),
                _ => println!("  Binary logging is disabled"),
            }
            if let Some(id) = &r.server_id {
                println!("  Server id: {id}");
            }
        } else {
            println!("✗ Cannot connect to {}: {}", r.target, r.error.as_deref().unwrap_or("unknown error"));
        }
    })?;
    Ok(if result.reachable { 0 } else { EXIT_FAILURE })
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

fn print_backup(report: &BackupReport) {
    println!("Backup {} ({}): {:?}", report.artifact_id, report.class, report.status);
    println!("  Location: {}", report.path.display());
    for component in &report.components {
        println!(
            "  {:<28} {:?} {}",
            component.relative_path,
            component.status,
            format_size(component.byte_size)
        );
    }
    if let Some((file, pos)) = report.checkpoint.as_ref().and_then(|c| c.coordinates()) {
        println!("  Binlog position: {file}:{pos}");
    }
    if let Some(rotation) = &report.rotation {
        if !rotation.skipped {
            println!("  Retention: kept {}, deleted {}", rotation.retained.len(), rotation.deleted.len());
        }
    }
    for issue in &report.issues {
        println!("  ! {}", issue.message);
    }
    println!("  Elapsed: {:.1}s", report.elapsed_ms as f64 / 1000.0);
}

fn print_list(backups: &[ArtifactSummary]) {
    if backups.is_empty() {
        println!("No backups found.");
        return;
    }
    println!(
        "{:<8} {:<18} {:<9} {:<20} {:>10}  {}",
        "CLASS", "ID", "STATUS", "CREATED", "SIZE", "BINLOG"
    );
    for backup in backups {
        let binlog = backup
            .checkpoint
            .as_ref()
            .and_then(|c| c.coordinates())
            .map(|(file, pos)| format!("{file}:{pos}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:<18} {:<9} {:<20} {:>10}  {}",
            backup.class.as_str(),
            backup.id.as_str(),
            format!("{:?}", backup.status),
            backup.created_at.format("%Y-%m-%d %H:%M:%S"),
            format_size(backup.size_bytes),
            binlog
        );
    }
}

fn print_restore(report: &RestoreReport) {
    println!("Restore: {:?}", report.outcome);
    if let Some(path) = &report.path {
        println!("  Artifact: {}", path.display());
    }
    for step in &report.steps {
        println!(
            "  {:<20} {:?}{}",
            format!("{:?}", step.step),
            step.status,
            step.detail.as_ref().map(|d| format!(" - {d}")).unwrap_or_default()
        );
    }
    for issue in &report.issues {
        match issue.replication {
            Some(reason) => println!("  ! {} (next step: {})", issue.message, reason.remedy()),
            None => println!("  ! {}", issue.message),
        }
    }
}

fn print_rotation(report: &RotationReport) {
    if report.skipped {
        println!("Retention for {} is disabled (keep = 0)", report.class);
        return;
    }
    println!(
        "Retention for {}: kept {}, deleted {}, ignored {} partial",
        report.class,
        report.retained.len(),
        report.deleted.len(),
        report.ignored_partial.len()
    );
    for failure in &report.failures {
        println!("  ! {}", failure.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_restore_as_replica() {
        let args = Args::try_parse_from([
            "mariadb-backup",
            "--json",
            "restore",
            "backup_20240309",
            "--replica",
            "--master-host",
            "db-primary",
            "--yes",
        ])
        .unwrap();
        assert!(args.json);
        match args.command {
            Command::Restore {
                artifact,
                replica,
                master_host,
                yes,
                ..
            } => {
                assert_eq!(artifact, "backup_20240309");
                assert!(replica && yes);
                assert_eq!(master_host.as_deref(), Some("db-primary"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_class() {
        assert!(Args::try_parse_from(["mariadb-backup", "backup", "weekly"]).is_err());
        assert!(Args::try_parse_from(["mariadb-backup", "restore", "x", "--master-host", "h"]).is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }
}
