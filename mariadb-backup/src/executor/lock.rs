//! Advisory lock serializing backups that write to the same target.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Held for the lifetime of one backup job. The lock file is removed when
/// the guard is dropped.
#[derive(Debug)]
pub struct TargetLock {
    path: PathBuf,
    _file: Flock<File>,
}

impl TargetLock {
    /// Take the lock without waiting. `Ok(None)` means another job holds it.
    pub fn acquire(path: &Path) -> io::Result<Option<Self>> {
        loop {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(path)?;

            let locked = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(locked) => locked,
                Err((_, Errno::EWOULDBLOCK)) => return Ok(None),
                Err((_, errno)) => return Err(io::Error::from(errno)),
            };

            // A releasing holder unlinks the path; if that happened between
            // our open and our lock, we hold an orphaned inode and must retry.
            let held = locked.metadata()?;
            match std::fs::metadata(path) {
                Ok(current) if current.dev() == held.dev() && current.ino() == held.ino() => {
                    debug!(lock = %path.display(), "Acquired target lock");
                    return Ok(Some(Self {
                        path: path.to_path_buf(),
                        _file: locked,
                    }));
                }
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        // Unlink while still holding the lock; the file closes afterwards.
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(lock = %self.path.display(), error = %e, "Could not remove lock file");
            }
        }
    }
}
