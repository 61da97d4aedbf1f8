//! Writers and readers for component files.
//!
//! Write side: producer -> zstd encoder -> (`openssl enc` | file).
//! Read side: (`openssl enc -d` | file) -> zstd decoder -> consumer.
//! Both sides must be closed with `finish()` so the external cipher's exit
//! status is checked and the file is flushed to stable storage.

use super::{CipherTool, Compression, Encoding, StreamOptions};
use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use async_compression::Level;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};

type BoxWriter = Box<dyn AsyncWrite + Unpin + Send>;
type BoxReader = Box<dyn AsyncRead + Unpin + Send>;

/// Encoded output for one component file.
pub struct ComponentWriter {
    path: PathBuf,
    sink: BoxWriter,
    cipher: Option<Child>,
}

impl ComponentWriter {
    pub async fn create(path: &Path, options: &StreamOptions) -> io::Result<Self> {
        let (base, cipher): (BoxWriter, Option<Child>) = match &options.cipher {
            Some(tool) => {
                let mut child = Command::new(&tool.openssl_bin)
                    .args(tool.args(false))
                    .arg("-out")
                    .arg(path)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| io::Error::other("cipher stdin unavailable"))?;
                (Box::new(stdin), Some(child))
            }
            None => {
                let file = tokio::fs::File::create(path).await?;
                (Box::new(BufWriter::new(file)), None)
            }
        };

        let sink: BoxWriter = if options.compress {
            Box::new(ZstdEncoder::with_quality(
                base,
                Level::Precise(options.compression_level),
            ))
        } else {
            base
        };

        Ok(Self {
            path: path.to_path_buf(),
            sink,
            cipher,
        })
    }

    pub fn sink(&mut self) -> &mut (dyn AsyncWrite + Unpin + Send) {
        self.sink.as_mut()
    }

    /// Flush every stage, wait for the cipher and fsync the file.
    pub async fn finish(self) -> io::Result<()> {
        let Self {
            path,
            mut sink,
            cipher,
        } = self;

        sink.shutdown().await?;
        // Closing the cipher's stdin is what ends its input
        drop(sink);

        if let Some(child) = cipher {
            let output = child.wait_with_output().await?;
            if !output.status.success() {
                return Err(io::Error::other(format!(
                    "cipher exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }

        tokio::fs::File::open(&path).await?.sync_all().await
    }
}

/// Decoded input from one component file.
pub struct ComponentReader {
    source: BoxReader,
    cipher: Option<Child>,
}

impl ComponentReader {
    pub async fn open(
        path: &Path,
        encoding: &Encoding,
        cipher: Option<&CipherTool>,
    ) -> io::Result<Self> {
        let (base, child): (BoxReader, Option<Child>) = if encoding.encrypted {
            let tool = cipher.ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "component is encrypted but no cipher is configured",
                )
            })?;
            if !path.is_file() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not found", path.display()),
                ));
            }
            let mut child = Command::new(&tool.openssl_bin)
                .args(tool.args(true))
                .arg("-in")
                .arg(path)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| io::Error::other("cipher stdout unavailable"))?;
            (Box::new(stdout), Some(child))
        } else {
            (Box::new(tokio::fs::File::open(path).await?), None)
        };

        let source: BoxReader = match encoding.compression {
            Some(Compression::Zstd) => Box::new(ZstdDecoder::new(BufReader::new(base))),
            None => base,
        };

        Ok(Self {
            source,
            cipher: child,
        })
    }

    pub fn source(&mut self) -> &mut (dyn AsyncRead + Unpin + Send) {
        self.source.as_mut()
    }

    /// Release the stream and check the cipher's exit status.
    pub async fn finish(self) -> io::Result<()> {
        let Self { source, cipher } = self;
        drop(source);

        if let Some(child) = cipher {
            let output = child.wait_with_output().await?;
            if !output.status.success() {
                return Err(io::Error::other(format!(
                    "cipher exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }
        Ok(())
    }
}
