//! Error types for backup runs.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Preflight check failed: {0}")]
    Preflight(String),

    #[error("Another backup is already running ({})", describe_holder(*pid))]
    AlreadyRunning { pid: Option<i32> },

    #[error("Backup interrupted")]
    Interrupted,

    #[error("Archive build failed: {0}")]
    Build(String),

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Hash ledger error: {0}")]
    Ledger(#[source] std::io::Error),

    #[error("Lock file error: {0}")]
    Lock(#[source] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BackupError {
    pub(crate) fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::Read {
            path: path.into(),
            source,
        }
    }
}

fn describe_holder(pid: Option<i32>) -> String {
    match pid {
        Some(pid) => format!("pid {}", pid),
        None => "pid not yet recorded".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
