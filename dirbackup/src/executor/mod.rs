//! Backup job executor - sequences a single backup run.
//!
//! Validating → LockAcquired → Hashing → {Skipping | Building} → Recording →
//! RotatingOut → Done. Any error moves the run to Failed; the lock is held by
//! an RAII guard and released on every path out of [`BackupExecutor::execute`].
//!
//! Cancelling the executor's token stops the run at the next entry of a walk,
//! while waiting for the compressor, or between phases, up to the moment the
//! archive is moved into place. From then on the run completes.

pub mod ledger;

use crate::archive::compressor::{self, Compressor};
use crate::archive::ArchiveBuilder;
use crate::config::Config;
use crate::daemon::lock::BackupLock;
use crate::daemon::shutdown::CleanupRegistry;
use crate::digest::{hash_tree, ContentDigest};
use crate::fs::ignore;
use crate::fs::walker::WalkOptions;
use crate::retention::{self, RetentionReport};
use crate::utils::errors::{BackupError, Result};
use chrono::NaiveDateTime;
use ledger::Ledger;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Immutable configuration for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupJob {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub prefix: String,
    pub retention_days: u32,
}

impl BackupJob {
    /// Validate and resolve a job.
    ///
    /// The source must be a directory; the destination must be an existing,
    /// writable directory. Both paths are canonicalized.
    pub fn new(
        source: impl AsRef<Path>,
        destination: impl AsRef<Path>,
        prefix: &str,
        retention_days: u32,
    ) -> Result<Self> {
        let (source, destination) = (source.as_ref(), destination.as_ref());

        if prefix.is_empty() || prefix.starts_with('.') || prefix.contains(['/', '\\']) {
            return Err(BackupError::Preflight(format!(
                "invalid backup prefix {:?}",
                prefix
            )));
        }

        let source = source
            .canonicalize()
            .ok()
            .filter(|p| p.is_dir())
            .ok_or_else(|| {
                BackupError::Preflight(format!(
                    "source directory {} does not exist",
                    source.display()
                ))
            })?;

        let destination = destination
            .canonicalize()
            .ok()
            .filter(|p| p.is_dir())
            .ok_or_else(|| {
                BackupError::Preflight(format!(
                    "destination directory {} does not exist",
                    destination.display()
                ))
            })?;

        if destination == source {
            return Err(BackupError::Preflight(
                "destination must not be the source directory".to_string(),
            ));
        }

        if let Err(e) = tempfile::tempfile_in(&destination) {
            return Err(BackupError::Preflight(format!(
                "destination directory {} is not writable: {}",
                destination.display(),
                e
            )));
        }

        Ok(Self {
            source,
            destination,
            prefix: prefix.to_string(),
            retention_days,
        })
    }
}

/// Result of a successful run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    /// Content matched the latest ledger entry; nothing was written
    Skipped {
        digest: ContentDigest,
        retention: RetentionReport,
    },
    /// A new archive and ledger entry were written
    Created {
        archive: String,
        digest: ContentDigest,
        retention: RetentionReport,
    },
}

impl BackupOutcome {
    pub fn digest(&self) -> &ContentDigest {
        match self {
            BackupOutcome::Skipped { digest, .. } | BackupOutcome::Created { digest, .. } => digest,
        }
    }

    pub fn retention(&self) -> RetentionReport {
        match self {
            BackupOutcome::Skipped { retention, .. } | BackupOutcome::Created { retention, .. } => {
                *retention
            }
        }
    }
}

/// Run states, logged at debug level as the run advances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Validating,
    LockAcquired,
    Hashing,
    Skipping,
    Building,
    Recording,
    RotatingOut,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

type Clock = Box<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// Main backup executor
pub struct BackupExecutor {
    config: Config,
    compressor: Option<Arc<dyn Compressor>>,
    cleanup: Arc<CleanupRegistry>,
    cancel: CancellationToken,
    clock: Clock,
}

impl BackupExecutor {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            compressor: None,
            cleanup: Arc::new(CleanupRegistry::new()),
            cancel: CancellationToken::new(),
            clock: Box::new(|| chrono::Local::now().naive_local()),
        }
    }

    /// Use a fixed compressor instead of probing `PATH`
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Share a cleanup registry with the signal handler
    pub fn with_cleanup(mut self, cleanup: Arc<CleanupRegistry>) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Override the clock used for archive timestamps
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> NaiveDateTime + Send + Sync + 'static,
    {
        self.clock = Box::new(clock);
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cleanup(&self) -> Arc<CleanupRegistry> {
        Arc::clone(&self.cleanup)
    }

    /// Token that stops a run in progress
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute a backup job
    pub fn execute(&self, job: &BackupJob) -> Result<BackupOutcome> {
        let mut state = RunState::Validating;
        let result = self.run(job, &mut state);
        match &result {
            Ok(_) => transition(&mut state, RunState::Done),
            Err(e) => {
                debug!("Run failed in state {}: {}", state, e);
                transition(&mut state, RunState::Failed);
            }
        }
        result
    }

    fn run(&self, job: &BackupJob, state: &mut RunState) -> Result<BackupOutcome> {
        let _lock = BackupLock::acquire(&job.destination, &job.prefix, self.cleanup())?;
        transition(state, RunState::LockAcquired);
        self.checkpoint()?;

        let exclusions = ignore::resolve(&job.source, &self.config.files.ignore_file)?;
        let options = WalkOptions {
            exclusions,
            skip_paths: self.skip_paths(job),
            cancel: self.cancel.clone(),
        };
        let ledger = Ledger::at(&job.destination, &self.config.files.ledger_file);

        transition(state, RunState::Hashing);
        let (digest, stats) = hash_tree(&job.source, &options)?;
        debug!(
            "Content digest {} over {} files, {} dirs, {} bytes",
            digest, stats.files, stats.dirs, stats.bytes
        );
        let previous = ledger.latest(&job.prefix)?;
        self.checkpoint()?;

        let (created, digest) = if previous.as_ref() == Some(&digest) {
            transition(state, RunState::Skipping);
            info!("SKIPPED: no changes in {} since the last backup", job.source.display());
            (None, digest)
        } else {
            transition(state, RunState::Building);
            let builder = ArchiveBuilder::new(self.compressor());
            let archive = builder.build(job, &options, (self.clock)(), &self.cleanup)?;

            if archive.digest != digest {
                warn!(
                    "{} changed during the backup; recording the digest of the archived content",
                    job.source.display()
                );
            }

            transition(state, RunState::Recording);
            ledger.append(&archive.digest, &archive.file_name)?;
            info!("SUCCESS: created {}", archive.path.display());
            (Some(archive.file_name), archive.digest)
        };

        transition(state, RunState::RotatingOut);
        let retention = retention::enforce(&job.destination, &job.prefix, job.retention_days);
        if retention.removed > 0 || retention.failed > 0 {
            info!(
                "Retention ({} days): removed {}, kept {}, failed {}",
                job.retention_days, retention.removed, retention.kept, retention.failed
            );
        }

        Ok(match created {
            Some(archive) => BackupOutcome::Created {
                archive,
                digest,
                retention,
            },
            None => BackupOutcome::Skipped { digest, retention },
        })
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(BackupError::Interrupted)
        } else {
            Ok(())
        }
    }

    fn compressor(&self) -> Arc<dyn Compressor> {
        match &self.compressor {
            Some(compressor) => Arc::clone(compressor),
            None => Arc::from(compressor::select(&self.config.compression, None)),
        }
    }

    /// A destination nested in the source must never feed the digest or the
    /// archive.
    fn skip_paths(&self, job: &BackupJob) -> Vec<PathBuf> {
        if job.destination.starts_with(&job.source) {
            vec![job.destination.clone()]
        } else {
            Vec::new()
        }
    }
}

fn transition(state: &mut RunState, next: RunState) {
    debug!("{} -> {}", state, next);
    *state = next;
}
