//! Process-level concerns: cross-invocation locking and signal cleanup.

pub mod lock;
pub mod shutdown;

pub use lock::BackupLock;
pub use shutdown::{CleanupRegistry, ShutdownCoordinator};
