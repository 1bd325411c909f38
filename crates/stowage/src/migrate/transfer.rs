use crate::error::{Result, StowageError};
use crate::index::hasher::full_fingerprint;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

/// Byte movement used by the executor and rollback. Implementations must not
/// overwrite an existing destination.
pub trait Transfer: Send + Sync {
    /// Copies `from` to `to`, creating parent directories. Returns bytes copied.
    fn copy(&self, from: &Path, to: &Path) -> Result<u64>;

    /// Moves `from` to `to`, creating parent directories.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
}

/// Local filesystem transfer with bounded copies.
#[derive(Debug, Clone)]
pub struct LocalTransfer {
    timeout: Duration,
}

impl LocalTransfer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn timed_copy(&self, from: &Path, to: &Path) -> Result<u64> {
        let (tx, rx) = mpsc::channel();
        let src = from.to_path_buf();
        let dst = to.to_path_buf();
        std::thread::spawn(move || {
            let _ = tx.send(fs::copy(&src, &dst));
        });

        match rx.recv_timeout(self.timeout) {
            Ok(result) => Ok(result?),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::error!(
                    "Copy {} -> {} exceeded {}s",
                    from.display(),
                    to.display(),
                    self.timeout.as_secs()
                );
                Err(StowageError::Timeout {
                    operation: format!("copy {} -> {}", from.display(), to.display()),
                    seconds: self.timeout.as_secs(),
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(StowageError::Io(io::Error::new(
                io::ErrorKind::Other,
                "copy worker exited without a result",
            ))),
        }
    }

    /// Rename across filesystems: copy next to the destination, verify, move
    /// into place, then remove the source.
    fn cross_device_move(&self, from: &Path, to: &Path) -> Result<()> {
        let staging = staging_path(to);
        self.timed_copy(from, &staging)?;

        let expected = full_fingerprint(from)?;
        let actual = full_fingerprint(&staging)?;
        if expected != actual {
            let _ = fs::remove_file(&staging);
            return Err(StowageError::MoveFailed {
                path: from.to_path_buf(),
                reason: format!("cross-device copy mismatch: {} vs {}", expected, actual),
            });
        }

        fs::rename(&staging, to)?;
        fs::remove_file(from)?;
        Ok(())
    }
}

impl Default for LocalTransfer {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

fn staging_path(to: &Path) -> PathBuf {
    let name = to
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    to.with_file_name(format!(".{}.stowage-partial", name))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn refuse_existing(to: &Path) -> Result<()> {
    if to.exists() {
        return Err(StowageError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("destination exists: {}", to.display()),
        )));
    }
    Ok(())
}

impl Transfer for LocalTransfer {
    fn copy(&self, from: &Path, to: &Path) -> Result<u64> {
        if !from.exists() {
            return Err(StowageError::FileNotFound(from.to_path_buf()));
        }
        refuse_existing(to)?;
        ensure_parent(to)?;
        self.timed_copy(from, to)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if !from.exists() {
            return Err(StowageError::FileNotFound(from.to_path_buf()));
        }
        refuse_existing(to)?;
        ensure_parent(to)?;

        match fs::rename(from, to) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
                log::debug!(
                    "{} and {} are on different devices, copying",
                    from.display(),
                    to.display()
                );
                self.cross_device_move(from, to)
            }
            Err(e) => Err(StowageError::Io(e)),
        }
    }
}
