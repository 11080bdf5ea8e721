//! Source tree access: exclusion rules and ordered traversal.

pub mod ignore;
pub mod walker;

pub use ignore::Exclusions;
pub use walker::{walk_directory, walk_directory_with_callback, EntryKind, FileInfo, WalkOptions};
