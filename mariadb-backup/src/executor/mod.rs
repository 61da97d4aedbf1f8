//! Backup job coordinator - runs one backup invocation end to end.
//!
//! Order of work:
//! - resolve the target and take its lock (single flight per class/target)
//! - capture the checkpoint and export data into a staging directory
//! - export users and grants (non-fatal)
//! - hash components, write the manifest, promote staging to the final name
//! - apply retention for the class, then send the webhook
//!
//! The previous artifact of the same id is only replaced by the promotion
//! step, so a failed or cancelled run never damages it.

pub mod checkpoint;
pub mod dump;
pub mod lock;

use crate::artifact::catalog::{dir_size, list_backups};
use crate::artifact::manifest::{Checkpoint, Component, ManifestBuilder, MANIFEST_FILE};
use crate::artifact::{ArtifactId, ArtifactStatus, ArtifactSummary, ArtifactTarget, Clock, RetentionClass};
use crate::config::Config;
use crate::engine::DatabaseEngine;
use crate::notify::{BackupEvent, WebhookNotifier};
use crate::retention::{self, RetentionPolicy, RotationReport};
use crate::utils::errors::{BackupError, Issue, Result};
use chrono::{DateTime, Utc};
use dump::DumpAdapter;
use lock::TargetLock;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// One `CreateBackup` invocation.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub class: RetentionClass,
    /// Alternative storage root, manual backups only
    pub path_override: Option<PathBuf>,
}

impl BackupRequest {
    pub fn new(class: RetentionClass) -> Self {
        Self {
            class,
            path_override: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path_override = Some(path.into());
        self
    }
}

/// Structured result of a backup job.
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub run_id: Uuid,
    pub class: RetentionClass,
    pub artifact_id: ArtifactId,
    /// Final artifact directory, or the staging directory if the job aborted
    pub path: PathBuf,
    pub status: ArtifactStatus,
    pub components: Vec<Component>,
    pub checkpoint: Option<Checkpoint>,
    pub rotation: Option<RotationReport>,
    pub issues: Vec<Issue>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl BackupReport {
    fn new(target: &ArtifactTarget) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            class: target.class,
            artifact_id: target.id.clone(),
            path: target.staging_dir(),
            status: ArtifactStatus::Partial,
            components: Vec::new(),
            checkpoint: None,
            rotation: None,
            issues: Vec::new(),
            started_at: target.captured_at,
            elapsed_ms: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == ArtifactStatus::Complete
    }

    /// Complete, but something non-fatal was recorded.
    pub fn is_degraded(&self) -> bool {
        self.is_complete() && !self.issues.is_empty()
    }
}

/// Sequences backup jobs against one database engine.
pub struct BackupCoordinator {
    config: Config,
    engine: Arc<dyn DatabaseEngine>,
    notifier: Option<WebhookNotifier>,
    cancel_token: CancellationToken,
}

impl BackupCoordinator {
    /// Create a coordinator (no cancellation support)
    pub fn new(config: Config, engine: Arc<dyn DatabaseEngine>) -> Self {
        Self::with_cancel(config, engine, CancellationToken::new())
    }

    /// Create a coordinator whose jobs stop when `cancel_token` fires
    pub fn with_cancel(config: Config, engine: Arc<dyn DatabaseEngine>, cancel_token: CancellationToken) -> Self {
        let webhooks = &config.webhooks;
        let notifier = (!webhooks.success_url.trim().is_empty() || !webhooks.failure_url.trim().is_empty())
            .then(|| WebhookNotifier::new(webhooks.clone()));
        Self {
            config,
            engine,
            notifier,
            cancel_token,
        }
    }

    /// `CreateBackup`. Rejections that happen before any work starts
    /// (bad request, job already running, manual id taken) are errors; every
    /// other outcome, including fatal pipeline failures, is a report.
    pub async fn create_backup(&self, request: BackupRequest, clock: &dyn Clock) -> Result<BackupReport> {
        let started = Instant::now();
        let class = request.class;
        let target = ArtifactTarget::resolve(
            class,
            clock.now(),
            self.config.backup_paths.root(class),
            request.path_override.as_deref(),
        )?;

        tokio::fs::create_dir_all(&target.root).await?;
        let _lock = TargetLock::acquire(&target.lock_path())?.ok_or_else(|| BackupError::JobAlreadyRunning {
            class,
            target: target.dir(),
        })?;
        recover_interrupted(&target).await?;

        if class == RetentionClass::Manual && tokio::fs::try_exists(target.dir()).await? {
            return Err(BackupError::ArtifactExists(target.dir()));
        }

        info!(
            class = %class,
            artifact = %target.id,
            engine = %self.engine.describe(),
            "Starting backup"
        );

        let mut report = BackupReport::new(&target);
        match self.run_pipeline(&target, &mut report).await {
            Ok(()) => {
                report.path = target.dir();
                if report.is_complete() {
                    self.rotate(&target, &mut report).await;
                }
            }
            Err(e) => {
                report.status = match e {
                    BackupError::Cancelled => ArtifactStatus::Partial,
                    _ => ArtifactStatus::Failed,
                };
                error!(class = %class, artifact = %target.id, error = %e, "Backup aborted");
                report.issues.push(Issue::from(e));
            }
        }
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        self.notify(&report).await;

        info!(
            class = %class,
            artifact = %report.artifact_id,
            status = ?report.status,
            issues = report.issues.len(),
            elapsed_ms = report.elapsed_ms,
            "Backup finished"
        );
        Ok(report)
    }

    async fn run_pipeline(&self, target: &ArtifactTarget, report: &mut BackupReport) -> Result<()> {
        let options = self.config.options.stream_options()?;
        let staging = target.staging_dir();

        // A leftover staging directory belongs to an aborted run of this id.
        if tokio::fs::try_exists(&staging).await? {
            warn!(path = %staging.display(), "Removing stale staging directory");
            tokio::fs::remove_dir_all(&staging).await?;
        }
        tokio::fs::create_dir_all(&staging).await?;

        self.engine
            .ping()
            .await
            .map_err(|e| BackupError::DumpFailed(format!("cannot reach {}: {e}", self.engine.describe())))?;

        let pre_read = checkpoint::capture(self.engine.as_ref(), target.captured_at).await;
        let embed_coordinates = pre_read.has_coordinates();
        let adapter = DumpAdapter::new(self.engine.as_ref(), &options);

        let data = tokio::select! {
            result = adapter.dump_data(&staging, embed_coordinates) => result?,
            _ = self.cancel_token.cancelled() => return Err(BackupError::Cancelled),
        };
        let checkpoint = checkpoint::reconcile(pre_read, data.coordinates.clone());
        if !checkpoint.has_coordinates() {
            info!(artifact = %target.id, "No replication coordinates recorded");
        }

        let users = tokio::select! {
            component = adapter.export_users(&staging) => component,
            _ = self.cancel_token.cancelled() => return Err(BackupError::Cancelled),
        };
        if let Some(message) = &users.error {
            report
                .issues
                .push(Issue::from(BackupError::UserExportFailed(message.clone())));
        }

        let mut builder = ManifestBuilder::new(target.id.clone(), target.class, target.captured_at, checkpoint);
        builder.add(data.component).add(users);
        let manifest = builder.build(&staging).await?;

        if self.cancel_token.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        manifest.persist(&staging).await?;
        promote(target).await?;

        report.status = manifest.status;
        report.checkpoint = Some(manifest.checkpoint);
        report.components = manifest.components;
        Ok(())
    }

    /// Retention runs only after this job's artifact is complete; its
    /// failures are recorded, never raised.
    async fn rotate(&self, target: &ArtifactTarget, report: &mut BackupReport) {
        match retention::apply_retention(&target.root, target.class, &self.config.rotation).await {
            Ok(rotation) => {
                report.issues.extend(rotation.failures.iter().cloned());
                report.rotation = Some(rotation);
            }
            Err(e) => {
                warn!(class = %target.class, error = %e, "Retention pass failed");
                report.issues.push(Issue::from(e));
            }
        }
    }

    async fn notify(&self, report: &BackupReport) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let message = match report.issues.first() {
            Some(issue) if !report.is_complete() => issue.message.clone(),
            Some(_) => "Backup completed with warnings".to_string(),
            None => "Backup completed".to_string(),
        };
        let size = report.is_complete().then(|| {
            report.components.iter().map(|c| c.byte_size).sum::<u64>()
        });
        let event = BackupEvent::new(report.is_complete(), report.class, &report.path, Some(message), size);
        notifier.notify(&event).await;
    }

    /// `ListBackups` over the configured class roots.
    pub async fn list_backups(&self, filter: Option<RetentionClass>) -> Result<Vec<ArtifactSummary>> {
        list_backups(&self.config.backup_paths, filter).await
    }

    /// `ApplyRetention` for one class outside of a backup job.
    pub async fn apply_retention(&self, class: RetentionClass, policy: &RetentionPolicy) -> Result<RotationReport> {
        retention::apply_retention(self.config.backup_paths.root(class), class, policy).await
    }
}

/// Finish or undo a promotion that a crash interrupted between its two
/// renames. A staging directory holding a manifest is a finished build and
/// wins over the parked previous artifact.
async fn recover_interrupted(target: &ArtifactTarget) -> Result<()> {
    let final_dir = target.dir();
    if tokio::fs::try_exists(&final_dir).await? {
        return Ok(());
    }

    let staging = target.staging_dir();
    let trash = target.trash_dir();
    if tokio::fs::try_exists(staging.join(MANIFEST_FILE)).await? {
        warn!(artifact = %target.id, "Completing interrupted promotion");
        tokio::fs::rename(&staging, &final_dir).await?;
    } else if tokio::fs::try_exists(&trash).await? {
        warn!(artifact = %target.id, "Restoring artifact parked by an interrupted promotion");
        tokio::fs::rename(&trash, &final_dir).await?;
    }
    Ok(())
}

/// Swap the staging directory into place. The superseded artifact is parked
/// under a trash name first so the final path never holds a mix of both.
async fn promote(target: &ArtifactTarget) -> Result<()> {
    let final_dir = target.dir();
    let trash = target.trash_dir();

    if tokio::fs::try_exists(&trash).await? {
        tokio::fs::remove_dir_all(&trash).await?;
    }
    let replacing = tokio::fs::try_exists(&final_dir).await?;
    if replacing {
        tokio::fs::rename(&final_dir, &trash)
            .await
            .map_err(|e| promote_error(&final_dir, e))?;
    }
    tokio::fs::rename(target.staging_dir(), &final_dir)
        .await
        .map_err(|e| promote_error(&final_dir, e))?;

    if replacing {
        info!(artifact = %target.id, "Replaced previous artifact for this period");
        if let Err(e) = tokio::fs::remove_dir_all(&trash).await {
            warn!(path = %trash.display(), error = %e, "Could not remove superseded artifact");
        }
    }

    let size = dir_size(&final_dir);
    info!(path = %final_dir.display(), bytes = size, "Artifact promoted");
    Ok(())
}

fn promote_error(dir: &Path, e: std::io::Error) -> BackupError {
    BackupError::ManifestWriteFailed(format!("cannot promote {}: {e}", dir.display()))
}
