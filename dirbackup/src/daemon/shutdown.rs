//! Termination handling for SIGTERM and SIGINT.
//!
//! On a signal the binary cancels the running backup and waits for it to
//! unwind, so the lock and any temporary archive are removed by their owners
//! once the work has actually stopped. Paths that must not outlive the run are
//! also recorded in a [`CleanupRegistry`], which the binary empties if the run
//! does not stop within its grace period.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{Signal, SignalKind};
use tracing::{info, warn};

/// Paths to delete if the process is terminated early
#[derive(Debug, Default)]
pub struct CleanupRegistry {
    paths: Mutex<Vec<PathBuf>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PathBuf>> {
        // A poisoned list is still a valid list of paths.
        self.paths.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, path: &Path) {
        self.lock().push(path.to_path_buf());
    }

    pub fn unregister(&self, path: &Path) {
        self.lock().retain(|p| p != path);
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove every registered path, most recent first. Returns how many
    /// files were removed.
    pub fn run(&self) -> usize {
        let paths = std::mem::take(&mut *self.lock());
        let mut removed = 0;
        for path in paths.iter().rev() {
            match std::fs::remove_file(path) {
                Ok(()) => {
                    info!("Removed {}", path.display());
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
        removed
    }
}

/// Waits for a termination signal
///
/// Handlers are installed by [`ShutdownCoordinator::install`]; from then on
/// SIGINT and SIGTERM no longer terminate the process and are reported by
/// [`ShutdownCoordinator::wait_for_signal`] instead.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    #[cfg(unix)]
    interrupt: Signal,
    #[cfg(unix)]
    terminate: Signal,
}

impl ShutdownCoordinator {
    /// Install the signal handlers. Must be called inside a Tokio runtime.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            interrupt: signal::unix::signal(SignalKind::interrupt())?,
            #[cfg(unix)]
            terminate: signal::unix::signal(SignalKind::terminate())?,
        })
    }

    /// Wait for SIGINT or SIGTERM and return the signal name
    pub async fn wait_for_signal(&mut self) -> std::io::Result<&'static str> {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.interrupt.recv() => Ok("SIGINT"),
                _ = self.terminate.recv() => Ok("SIGTERM"),
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            Ok("SIGINT")
        }
    }
}
