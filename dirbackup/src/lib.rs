//! dirbackup library
//!
//! Content-addressed directory snapshots: skips unchanged trees, serializes
//! concurrent runs per backup prefix, and rotates old archives.

pub mod archive;
pub mod config;
pub mod daemon;
pub mod digest;
pub mod executor;
pub mod fs;
pub mod retention;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{BackupExecutor, BackupJob, BackupOutcome};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
