//! Per-prefix lock file.
//!
//! `<dest>/<prefix>.lock` holds the PID of the process running a backup for
//! that prefix. Ownership is an exclusive `flock` on the open file; the PID is
//! written only while that lock is held and is used for reporting and for
//! recognising lock files from a holder that is still alive. A file whose PID
//! is dead (or whose content cannot be parsed) is stale and gets overwritten.

use crate::daemon::shutdown::CleanupRegistry;
use crate::utils::errors::{BackupError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempts before giving up on a lock file that keeps being replaced
const MAX_ATTEMPTS: usize = 5;

/// Lock file path for a prefix
pub fn lock_path(destination: &Path, prefix: &str) -> PathBuf {
    destination.join(format!("{}.lock", prefix))
}

/// Held backup lock, released on drop
pub struct BackupLock {
    path: PathBuf,
    pid: u32,
    file: Option<Flock<File>>,
    cleanup: Arc<CleanupRegistry>,
}

impl fmt::Debug for BackupLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupLock")
            .field("path", &self.path)
            .field("pid", &self.pid)
            .field("held", &self.file.is_some())
            .finish()
    }
}

impl BackupLock {
    /// Acquire the lock for `prefix` in `destination` without blocking.
    ///
    /// Fails with [`BackupError::AlreadyRunning`] if another process holds the
    /// `flock`, or if the file names a process that is still alive.
    pub fn acquire(destination: &Path, prefix: &str, cleanup: Arc<CleanupRegistry>) -> Result<Self> {
        let path = lock_path(destination, prefix);
        let pid = std::process::id();

        for _ in 0..MAX_ATTEMPTS {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(BackupError::Lock)?;

            let mut locked = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(locked) => locked,
                Err((_, Errno::EWOULDBLOCK)) => {
                    return Err(BackupError::AlreadyRunning {
                        pid: wait_for_owner(&path),
                    });
                }
                Err((_, errno)) => return Err(BackupError::Lock(errno.into())),
            };

            // A previous holder may have unlinked the file after we opened it.
            if !is_current(&locked, &path).map_err(BackupError::Lock)? {
                debug!("Lock {} was replaced while waiting, retrying", path.display());
                continue;
            }

            let content = read_content(&mut locked).map_err(BackupError::Lock)?;
            match parse_owner(&content) {
                Some(owner) if is_process_alive(owner) => {
                    return Err(BackupError::AlreadyRunning { pid: Some(owner) });
                }
                Some(owner) => {
                    warn!("Replacing stale lock {} (pid {} is not running)", path.display(), owner)
                }
                None if !content.trim().is_empty() => {
                    warn!("Replacing unreadable lock {}", path.display())
                }
                None => {}
            }

            write_pid(&mut locked, pid).map_err(BackupError::Lock)?;
            cleanup.register(&path);
            debug!("Acquired lock {} (pid {})", path.display(), pid);
            return Ok(Self {
                path,
                pid,
                file: Some(locked),
                cleanup,
            });
        }

        Err(BackupError::Lock(std::io::Error::new(
            ErrorKind::WouldBlock,
            format!("{} keeps being replaced", path.display()),
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock. Safe to call more than once.
    ///
    /// The file is only removed if it still names this process. It is
    /// unlinked before the `flock` is dropped.
    pub fn release(&mut self) {
        let Some(mut file) = self.file.take() else {
            return;
        };
        self.cleanup.unregister(&self.path);

        match read_content(&mut file) {
            Ok(content) if parse_owner(&content) == Some(self.pid as i32) => {
                match std::fs::remove_file(&self.path) {
                    Ok(()) => debug!("Released lock {}", self.path.display()),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to remove lock {}: {}", self.path.display(), e),
                }
            }
            Ok(_) => warn!("Lock {} no longer belongs to us, leaving it", self.path.display()),
            Err(e) => warn!("Failed to read lock {}: {}", self.path.display(), e),
        }
        drop(file);
    }
}

impl Drop for BackupLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// PID recorded in lock file content; `None` if the content is not a PID.
fn parse_owner(content: &str) -> Option<i32> {
    content.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
}

fn read_content(file: &mut File) -> std::io::Result<String> {
    file.seek(SeekFrom::Start(0))?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    Ok(content)
}

fn write_pid(file: &mut File, pid: u32) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(pid.to_string().as_bytes())?;
    file.sync_all()
}

/// Whether `file` is still the inode at `path`
fn is_current(file: &File, path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(on_disk) => Ok(held.dev() == on_disk.dev() && held.ino() == on_disk.ino()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// PID of the current holder. A holder that has just taken the `flock` may
/// not have written it yet, so give it a moment.
fn wait_for_owner(path: &Path) -> Option<i32> {
    for _ in 0..20 {
        if let Some(owner) = std::fs::read_to_string(path).ok().as_deref().and_then(parse_owner) {
            return Some(owner);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    None
}

/// Check if process is alive
pub fn is_process_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Signal 0 checks existence without delivering anything.
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true, // EPERM: exists, owned by someone else
    }
}
