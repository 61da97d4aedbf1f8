//! Webhook notifications after each backup.
//!
//! Delivery is best effort: failures are logged and never change the
//! outcome of the job that triggered them.

use crate::artifact::RetentionClass;
use crate::config::WebhookConfig;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// JSON body posted to the success or failure URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupEvent {
    pub status: &'static str,
    pub backup_type: RetentionClass,
    pub backup_dir: String,
    pub backup_name: Option<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl BackupEvent {
    pub fn new(
        success: bool,
        class: RetentionClass,
        dir: &Path,
        message: Option<String>,
        size_bytes: Option<u64>,
    ) -> Self {
        Self {
            status: if success { "success" } else { "failure" },
            backup_type: class,
            backup_dir: dir.display().to_string(),
            backup_name: dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            message,
            size_bytes,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build webhook client ({}), using defaults", e);
                reqwest::Client::new()
            });
        Self { client, config }
    }

    /// URL configured for this outcome, if any.
    pub fn url_for(&self, event: &BackupEvent) -> Option<&str> {
        let url = if event.is_success() {
            &self.config.success_url
        } else {
            &self.config.failure_url
        };
        let url = url.trim();
        (!url.is_empty()).then_some(url)
    }

    pub async fn notify(&self, event: &BackupEvent) {
        let Some(url) = self.url_for(event) else {
            return;
        };

        match self.client.post(url).json(event).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!("Webhook sent ({}) to {}", event.status, url);
            }
            Ok(resp) => {
                warn!("Webhook to {} failed with status {}", url, resp.status());
            }
            Err(e) => {
                warn!("Failed to send webhook to {}: {}", url, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_payload() {
        let event = BackupEvent::new(
            true,
            RetentionClass::Daily,
            Path::new("/var/backups/mariadb/daily/backup_20240309"),
            Some("Backup completed".into()),
            Some(2048),
        );
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["status"], "success");
        assert_eq!(json["backup_type"], "daily");
        assert_eq!(json["backup_name"], "backup_20240309");
        assert_eq!(json["size_bytes"], 2048);
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_url_selection() {
        let notifier = WebhookNotifier::new(WebhookConfig {
            success_url: "http://hooks.local/ok".into(),
            failure_url: "  ".into(),
            timeout_secs: 1,
        });
        let ok = BackupEvent::new(true, RetentionClass::Hourly, Path::new("/b/backup_1"), None, None);
        let failed = BackupEvent::new(false, RetentionClass::Hourly, Path::new("/b/backup_1"), None, None);

        assert_eq!(notifier.url_for(&ok), Some("http://hooks.local/ok"));
        assert_eq!(notifier.url_for(&failed), None);

        let json = serde_json::to_value(&failed).unwrap();
        assert!(json.get("message").is_none());
    }
}
