//! Configuration management for the backup manager.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`MARIADB_BACKUP__MYSQL__HOST=db1`). The loaded value is passed explicitly
//! into the coordinator and restore orchestrator.

use crate::artifact::RetentionClass;
use crate::retention::RetentionPolicy;
use crate::transfer::{CipherTool, StreamOptions};
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "MARIADB_BACKUP";
const CONFIG_FILE_NAME: &str = "mariadb-backup.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mysql: MysqlConfig,
    pub backup_paths: BackupPaths,
    pub options: OptionsConfig,
    pub rotation: RetentionPolicy,
    pub replication: ReplicationConfig,
    pub webhooks: WebhookConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MysqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,

    /// Unix socket, takes precedence over host/port when set
    pub socket: Option<PathBuf>,

    /// Client binary used for queries and imports
    pub mysql_bin: PathBuf,

    /// Dump binary used for the full export
    pub mysqldump_bin: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupPaths {
    pub hourly: PathBuf,
    pub daily: PathBuf,
    pub monthly: PathBuf,
    pub manual: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionsConfig {
    /// Stream components through zstd
    pub compression: bool,

    /// Compression level (1-22 for zstd)
    pub compression_level: i32,

    /// Stream components through `openssl enc`
    pub encryption: bool,
    pub encryption_key_file: PathBuf,
    pub openssl_bin: PathBuf,
}

/// Default replication source used by restore-as-replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub master_host: String,
    pub master_user: String,
    pub master_password: String,
    pub master_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Empty disables the hook
    pub success_url: String,
    pub failure_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            socket: None,
            mysql_bin: PathBuf::from("mysql"),
            mysqldump_bin: PathBuf::from("mysqldump"),
        }
    }
}

impl Default for BackupPaths {
    fn default() -> Self {
        let base = Path::new("/var/backups/mariadb");
        Self {
            hourly: base.join("hourly"),
            daily: base.join("daily"),
            monthly: base.join("monthly"),
            manual: base.join("manual"),
        }
    }
}

impl BackupPaths {
    /// Storage root for a retention class.
    pub fn root(&self, class: RetentionClass) -> &Path {
        match class {
            RetentionClass::Hourly => &self.hourly,
            RetentionClass::Daily => &self.daily,
            RetentionClass::Monthly => &self.monthly,
            RetentionClass::Manual => &self.manual,
        }
    }
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            compression: true,
            compression_level: 3,
            encryption: false,
            encryption_key_file: PathBuf::from("/root/.mariadb_backup_key"),
            openssl_bin: PathBuf::from("openssl"),
        }
    }
}

impl OptionsConfig {
    /// Stream settings for writing new components.
    pub fn stream_options(&self) -> Result<StreamOptions> {
        let cipher = if self.encryption {
            if !self.encryption_key_file.is_file() {
                return Err(BackupError::Config(format!(
                    "encryption is enabled but key file {} does not exist",
                    self.encryption_key_file.display()
                )));
            }
            Some(self.cipher_tool())
        } else {
            None
        };

        Ok(StreamOptions {
            compress: self.compression,
            compression_level: self.compression_level,
            cipher,
        })
    }

    /// Cipher used to read encrypted artifacts, whether or not new backups
    /// are encrypted.
    pub fn cipher_tool(&self) -> CipherTool {
        CipherTool {
            openssl_bin: self.openssl_bin.clone(),
            key_file: self.encryption_key_file.clone(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            master_host: String::new(),
            master_user: String::new(),
            master_password: String::new(),
            master_port: 3306,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            success_url: String::new(),
            failure_url: String::new(),
            timeout_secs: 10,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, applying environment overrides
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        Self::build(Some(path))
    }

    /// Load from an explicit path, or the first existing search location, or
    /// defaults. Returns the file actually used.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::from_file(path)?, Some(path.to_path_buf())));
        }

        match Self::search_locations().into_iter().find(|p| p.is_file()) {
            Some(found) => {
                let config = Self::from_file(&found)?;
                Ok((config, Some(found)))
            }
            None => Ok((Self::build(None)?, None)),
        }
    }

    /// Candidate configuration files in priority order.
    pub fn search_locations() -> Vec<PathBuf> {
        let mut locations = vec![Path::new("/etc").join(CONFIG_FILE_NAME)];
        if let Some(home) = std::env::var_os("HOME") {
            locations.push(PathBuf::from(home).join(".config").join(CONFIG_FILE_NAME));
        }
        locations.push(PathBuf::from(CONFIG_FILE_NAME));
        locations
    }

    fn build(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Write the default configuration, readable only by the owner.
    pub fn write_default(path: &Path) -> anyhow::Result<()> {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(&Config::default())?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Copy with every password replaced by asterisks.
    pub fn redacted(&self) -> Self {
        fn mask(value: &str) -> String {
            if value.is_empty() {
                String::new()
            } else {
                "*".repeat(8)
            }
        }

        let mut copy = self.clone();
        copy.mysql.password = mask(&copy.mysql.password);
        copy.replication.master_password = mask(&copy.replication.master_password);
        copy
    }
}
