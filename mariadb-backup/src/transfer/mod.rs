//! Component streams: compression, encryption and digests.
//!
//! Compression runs in-process (zstd); encryption is delegated to an external
//! `openssl enc` process so no cipher is implemented here.

pub mod digest;
pub mod pipeline;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use digest::{sha256_file, FileDigest};
pub use pipeline::{ComponentReader, ComponentWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Zstd,
}

/// How a component file is encoded on disk. Recorded in the manifest so a
/// restore does not depend on the configuration at restore time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Encoding {
    #[serde(default)]
    pub compression: Option<Compression>,
    #[serde(default)]
    pub encrypted: bool,
}

impl Encoding {
    /// File name for a component with this encoding, e.g. `all_databases.sql.zst`.
    pub fn file_name(&self, base: &str) -> String {
        let mut name = base.to_string();
        if self.compression == Some(Compression::Zstd) {
            name.push_str(".zst");
        }
        if self.encrypted {
            name.push_str(".enc");
        }
        name
    }
}

/// External cipher invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherTool {
    pub openssl_bin: PathBuf,
    pub key_file: PathBuf,
}

impl CipherTool {
    fn args(&self, decrypt: bool) -> Vec<String> {
        let mut args = vec!["enc".to_string()];
        if decrypt {
            args.push("-d".to_string());
        }
        args.extend(
            ["-aes-256-cbc", "-pbkdf2", "-salt", "-pass"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(format!("file:{}", self.key_file.display()));
        args
    }
}

/// Settings for writing new components.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub compress: bool,
    pub compression_level: i32,
    pub cipher: Option<CipherTool>,
}

impl StreamOptions {
    /// Uncompressed, unencrypted.
    pub fn plain() -> Self {
        Self {
            compress: false,
            compression_level: 3,
            cipher: None,
        }
    }

    pub fn encoding(&self) -> Encoding {
        Encoding {
            compression: self.compress.then_some(Compression::Zstd),
            encrypted: self.cipher.is_some(),
        }
    }
}
