//! Restore orchestrator.
//!
//! A restore walks these states in order, recording each in the report:
//!
//! `Validating -> ReplayingData -> ReplayingUsers -> ConfiguringReplica -> Verifying -> Done`
//!
//! Any fatal error moves to `Failed`. Once data has been replayed nothing
//! later can undo it, so user replay and replica failures degrade the
//! outcome to `PartialSuccess` instead.

pub mod replica;

use crate::artifact::catalog::find_artifact;
use crate::artifact::manifest::{Checkpoint, ComponentKind, Manifest};
use crate::artifact::{ArtifactId, ArtifactStatus};
use crate::config::Config;
use crate::engine::DatabaseEngine;
use crate::transfer::{ComponentReader, Compression, Encoding};
use crate::utils::errors::{BackupError, ErrorKind, Issue, ReplicationFailure, Result};
use replica::ReplicaHealth;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub use replica::ReplicationSource;

/// How the caller names the artifact to restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactRef {
    Path(PathBuf),
    /// `20240309` or `backup_20240309`, looked up across class roots
    Id(String),
}

impl ArtifactRef {
    /// Anything with a path separator is a path; the rest is an id.
    pub fn parse(reference: &str) -> Self {
        if reference.contains(std::path::MAIN_SEPARATOR) {
            ArtifactRef::Path(PathBuf::from(reference))
        } else {
            ArtifactRef::Id(reference.to_string())
        }
    }
}

/// Turn the restored node into a replica of `source`.
#[derive(Debug, Clone)]
pub struct ReplicaConfigRequest {
    pub source: ReplicationSource,
    /// Overrides the checkpoint recorded in the artifact
    pub checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub artifact: ArtifactRef,
    pub replica: Option<ReplicaConfigRequest>,
    pub restore_users: bool,
    /// Accept an artifact without a manifest (integrity cannot be checked)
    /// or one whose manifest is not marked complete.
    pub allow_partial: bool,
}

impl RestoreRequest {
    pub fn new(artifact: ArtifactRef) -> Self {
        Self {
            artifact,
            replica: None,
            restore_users: true,
            allow_partial: false,
        }
    }

    pub fn as_replica(mut self, request: ReplicaConfigRequest) -> Self {
        self.replica = Some(request);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStep {
    Validating,
    ReplayingData,
    ReplayingUsers,
    ConfiguringReplica,
    Verifying,
    Done,
    Failed,
}

impl RestoreStep {
    fn next(self) -> Self {
        match self {
            RestoreStep::Validating => RestoreStep::ReplayingData,
            RestoreStep::ReplayingData => RestoreStep::ReplayingUsers,
            RestoreStep::ReplayingUsers => RestoreStep::ConfiguringReplica,
            RestoreStep::ConfiguringReplica => RestoreStep::Verifying,
            RestoreStep::Verifying | RestoreStep::Done => RestoreStep::Done,
            RestoreStep::Failed => RestoreStep::Failed,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, RestoreStep::Done | RestoreStep::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Skipped,
    Failed,
    /// Finished with an advisory warning
    Inconclusive,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: RestoreStep,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreOutcome {
    Success,
    PartialSuccess,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub run_id: Uuid,
    pub artifact_id: Option<ArtifactId>,
    pub path: Option<PathBuf>,
    pub outcome: RestoreOutcome,
    pub final_step: RestoreStep,
    pub steps: Vec<StepRecord>,
    pub issues: Vec<Issue>,
    pub data_restored: bool,
    pub users_restored: bool,
    pub replica_configured: bool,
    pub replica_health: Option<ReplicaHealth>,
    pub checkpoint: Option<Checkpoint>,
    pub elapsed_ms: u64,
}

impl RestoreReport {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            artifact_id: None,
            path: None,
            outcome: RestoreOutcome::Failed,
            final_step: RestoreStep::Validating,
            steps: Vec::new(),
            issues: Vec::new(),
            data_restored: false,
            users_restored: false,
            replica_configured: false,
            replica_health: None,
            checkpoint: None,
            elapsed_ms: 0,
        }
    }

    /// Reason the replica intent failed, if it did.
    pub fn replication_failure(&self) -> Option<ReplicationFailure> {
        self.issues.iter().find_map(|i| i.replication)
    }
}

/// A component ready to replay.
#[derive(Debug, Clone)]
struct Replayable {
    path: PathBuf,
    encoding: Encoding,
}

/// State carried between steps of one restore.
struct Session<'a> {
    request: &'a RestoreRequest,
    dir: PathBuf,
    manifest: Option<Manifest>,
    data: Option<Replayable>,
    users: Option<Replayable>,
    report: RestoreReport,
}

type StepResult = Result<(StepStatus, Option<String>)>;

pub struct RestoreOrchestrator {
    config: Config,
    engine: Arc<dyn DatabaseEngine>,
    cancel_token: CancellationToken,
    verify_delay: Duration,
}

impl RestoreOrchestrator {
    pub fn new(config: Config, engine: Arc<dyn DatabaseEngine>) -> Self {
        Self::with_cancel(config, engine, CancellationToken::new())
    }

    pub fn with_cancel(config: Config, engine: Arc<dyn DatabaseEngine>, cancel_token: CancellationToken) -> Self {
        Self {
            config,
            engine,
            cancel_token,
            verify_delay: Duration::from_secs(2),
        }
    }

    /// Time the replication threads get to connect before their status is read.
    pub fn with_verify_delay(mut self, delay: Duration) -> Self {
        self.verify_delay = delay;
        self
    }

    /// `RestoreBackup`. Returns an error only for a malformed request; every
    /// restore that starts ends in a report.
    pub async fn restore_backup(&self, request: RestoreRequest) -> Result<RestoreReport> {
        if let Some(replica) = &request.replica {
            replica.source.validate()?;
        }

        let started = Instant::now();
        let mut session = Session {
            request: &request,
            dir: PathBuf::new(),
            manifest: None,
            data: None,
            users: None,
            report: RestoreReport::new(),
        };

        let mut step = RestoreStep::Validating;
        while !step.is_terminal() {
            if self.cancel_token.is_cancelled() {
                warn!(step = ?step, "Restore cancelled");
                session.report.issues.push(Issue::from(BackupError::Cancelled));
                step = RestoreStep::Failed;
                break;
            }
            let began = Instant::now();
            let result = match step {
                RestoreStep::Validating => self.validate(&mut session).await,
                RestoreStep::ReplayingData => self.replay_data(&mut session).await,
                RestoreStep::ReplayingUsers => self.replay_users(&mut session).await,
                RestoreStep::ConfiguringReplica => self.configure_replica(&mut session).await,
                RestoreStep::Verifying => self.verify(&mut session).await,
                RestoreStep::Done | RestoreStep::Failed => break,
            };
            let elapsed_ms = began.elapsed().as_millis() as u64;

            step = match result {
                Ok((status, detail)) => {
                    session.report.steps.push(StepRecord { step, status, detail, elapsed_ms });
                    step.next()
                }
                Err(e) => {
                    let fatal = e.is_fatal();
                    let status = if e.kind() == ErrorKind::VerificationInconclusive {
                        StepStatus::Inconclusive
                    } else {
                        StepStatus::Failed
                    };
                    if fatal {
                        error!(step = ?step, error = %e, "Restore failed");
                    } else {
                        warn!(step = ?step, error = %e, "Restore step did not complete");
                    }
                    session.report.steps.push(StepRecord {
                        step,
                        status,
                        detail: Some(e.to_string()),
                        elapsed_ms,
                    });
                    session.report.issues.push(Issue::from(e));
                    if fatal {
                        RestoreStep::Failed
                    } else {
                        step.next()
                    }
                }
            };
        }

        let mut report = session.report;
        report.final_step = step;
        report.outcome = if step == RestoreStep::Failed || !report.data_restored {
            RestoreOutcome::Failed
        } else if report.issues.iter().any(|i| {
            matches!(i.kind, ErrorKind::UserReplayFailed | ErrorKind::ReplicationConfigFailed)
        }) {
            RestoreOutcome::PartialSuccess
        } else {
            RestoreOutcome::Success
        };
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            outcome = ?report.outcome,
            artifact = ?report.artifact_id.as_ref().map(|id| id.to_string()),
            elapsed_ms = report.elapsed_ms,
            "Restore finished"
        );
        Ok(report)
    }

    async fn resolve_dir(&self, artifact: &ArtifactRef) -> Result<PathBuf> {
        match artifact {
            ArtifactRef::Path(path) => {
                if tokio::fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false) {
                    Ok(path.clone())
                } else {
                    Err(BackupError::ArtifactNotFound(path.display().to_string()))
                }
            }
            ArtifactRef::Id(id) => Ok(find_artifact(&self.config.backup_paths, id).await?.path),
        }
    }

    async fn validate(&self, session: &mut Session<'_>) -> StepResult {
        session.dir = self.resolve_dir(&session.request.artifact).await?;
        session.report.path = Some(session.dir.clone());
        session.report.artifact_id = session
            .dir
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(ArtifactId::from_dir_name);

        let detail = match Manifest::load(&session.dir).await {
            Ok(manifest) => {
                if manifest.status != ArtifactStatus::Complete {
                    let reason = format!("{} is marked {:?}", session.dir.display(), manifest.status);
                    if !session.request.allow_partial {
                        return Err(BackupError::ArtifactIncomplete(reason));
                    }
                    warn!("{reason}; restoring the components it lists");
                }
                manifest.verify(&session.dir).await?;

                let dir = session.dir.clone();
                let replayable = |kind: ComponentKind| {
                    manifest.written(kind).map(|c| Replayable {
                        path: dir.join(&c.relative_path),
                        encoding: c.encoding,
                    })
                };
                session.data = replayable(ComponentKind::Data);
                session.users = replayable(ComponentKind::Users);
                session.report.checkpoint = Some(manifest.checkpoint.clone());
                session.report.artifact_id = Some(manifest.id.clone());

                let verified = manifest.components.iter().filter(|c| c.digest.is_some()).count();
                session.manifest = Some(manifest);
                format!("{verified} component(s) verified")
            }
            Err(BackupError::ArtifactNotFound(reason)) if session.request.allow_partial => {
                warn!(path = %session.dir.display(), "{reason}; restoring without integrity check");
                session.data = locate_unverified(&session.dir, ComponentKind::Data);
                session.users = locate_unverified(&session.dir, ComponentKind::Users);
                "no manifest, integrity not verified".to_string()
            }
            Err(e) => return Err(e),
        };

        if session.data.is_none() {
            return Err(BackupError::ArtifactIncomplete(format!(
                "{} has no data component",
                session.dir.display()
            )));
        }

        self.engine
            .ping()
            .await
            .map_err(|e| BackupError::RestoreFailed(format!("cannot reach {}: {e}", self.engine.describe())))?;

        Ok((StepStatus::Completed, Some(detail)))
    }

    async fn replay_data(&self, session: &mut Session<'_>) -> StepResult {
        let data = session
            .data
            .clone()
            .ok_or_else(|| BackupError::RestoreFailed("no data component".into()))?;

        info!(component = %data.path.display(), "Replaying data");
        let bytes = tokio::select! {
            result = self.replay(&data) => result.map_err(BackupError::RestoreFailed)?,
            _ = self.cancel_token.cancelled() => return Err(BackupError::Cancelled),
        };
        session.report.data_restored = true;
        Ok((StepStatus::Completed, Some(format!("{bytes} bytes replayed"))))
    }

    async fn replay_users(&self, session: &mut Session<'_>) -> StepResult {
        if !session.request.restore_users {
            return Ok((StepStatus::Skipped, Some("user restore not requested".into())));
        }
        let Some(users) = session.users.clone() else {
            return Ok((StepStatus::Skipped, Some("artifact has no user export".into())));
        };

        let bytes = tokio::select! {
            result = self.replay(&users) => result.map_err(BackupError::UserReplayFailed)?,
            _ = self.cancel_token.cancelled() => return Err(BackupError::Cancelled),
        };
        if let Err(e) = self.engine.execute("FLUSH PRIVILEGES").await {
            warn!(error = %e, "FLUSH PRIVILEGES failed after user replay");
        }
        session.report.users_restored = true;
        Ok((StepStatus::Completed, Some(format!("{bytes} bytes replayed"))))
    }

    async fn configure_replica(&self, session: &mut Session<'_>) -> StepResult {
        let Some(replica) = &session.request.replica else {
            return Ok((StepStatus::Skipped, None));
        };

        let checkpoint = replica
            .checkpoint
            .as_ref()
            .or(session.manifest.as_ref().map(|m| &m.checkpoint));
        let Some((log_file, log_position)) = checkpoint.and_then(|c| c.coordinates()) else {
            return Err(BackupError::ReplicationConfigFailed {
                reason: ReplicationFailure::MissingCoordinates,
                message: "the artifact carries no replication coordinates".into(),
            });
        };

        replica::configure(self.engine.as_ref(), &replica.source, log_file, log_position).await?;
        session.report.replica_configured = true;
        Ok((
            StepStatus::Completed,
            Some(format!("replicating from {}:{} at {log_file}:{log_position}", replica.source.host, replica.source.port)),
        ))
    }

    /// Advisory status read. Only a source that lost the requested log is
    /// promoted to a replication failure.
    async fn verify(&self, session: &mut Session<'_>) -> StepResult {
        if !session.report.replica_configured {
            return Ok((StepStatus::Skipped, None));
        }
        if !self.verify_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.verify_delay) => {}
                _ = self.cancel_token.cancelled() => return Err(BackupError::Cancelled),
            }
        }

        let status = self
            .engine
            .query("SHOW SLAVE STATUS")
            .await
            .map_err(|e| BackupError::VerificationInconclusive(format!("cannot read replica status: {e}")))?;
        let Some(health) = ReplicaHealth::from_status(&status) else {
            return Err(BackupError::VerificationInconclusive("replica status is empty".into()));
        };
        session.report.replica_health = Some(health.clone());

        if health.source_missing_log() {
            return Err(BackupError::ReplicationConfigFailed {
                reason: ReplicationFailure::CoordinatesUnavailable,
                message: health.last_io_error.clone().unwrap_or_else(|| health.summary()),
            });
        }
        if !health.is_running() {
            return Err(BackupError::VerificationInconclusive(health.summary()));
        }
        Ok((StepStatus::Completed, Some(health.summary())))
    }

    /// Stream one component into the engine; errors are plain text so the
    /// caller can choose the variant.
    async fn replay(&self, component: &Replayable) -> std::result::Result<u64, String> {
        let cipher = self.config.options.cipher_tool();
        let mut reader = ComponentReader::open(&component.path, &component.encoding, Some(&cipher))
            .await
            .map_err(|e| format!("cannot open {}: {e}", component.path.display()))?;

        let imported = self.engine.import(reader.source()).await;
        let finished = reader.finish().await;

        let report = imported.map_err(|e| e.to_string())?;
        finished.map_err(|e| format!("cannot decode {}: {e}", component.path.display()))?;
        Ok(report.bytes)
    }
}

/// Find a component by file name when there is no manifest to describe it.
fn locate_unverified(dir: &Path, kind: ComponentKind) -> Option<Replayable> {
    let encodings = [
        Encoding { compression: Some(Compression::Zstd), encrypted: true },
        Encoding { compression: None, encrypted: true },
        Encoding { compression: Some(Compression::Zstd), encrypted: false },
        Encoding::default(),
    ];
    encodings.into_iter().find_map(|encoding| {
        let path = dir.join(encoding.file_name(kind.base_name()));
        path.is_file().then_some(Replayable { path, encoding })
    })
}
