//! Directory traversal in a stable order.
//!
//! Entries are yielded depth-first with siblings sorted by file name, so two
//! walks over the same tree always produce the same sequence regardless of
//! how the filesystem enumerates directories.

use super::ignore::Exclusions;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Patterns from the ignore file
    pub exclusions: Exclusions,

    /// Absolute paths skipped regardless of patterns
    pub skip_paths: Vec<PathBuf>,

    /// Stops the walk before the next entry once cancelled
    pub cancel: CancellationToken,
}

/// Kind of a tree entry. Symlinks are never followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
    Other,
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes (0 for directories)
    pub size: u64,

    pub kind: EntryKind,

    /// Depth from root (1 = direct child)
    pub depth: usize,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let file_type = entry.file_type();
        let kind = if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };

        let size = match kind {
            EntryKind::File => entry.metadata()?.len(),
            _ => 0,
        };

        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Ok(Self {
            path,
            relative_path,
            size,
            kind,
            depth: entry.depth(),
        })
    }
}

/// Walk a directory tree with a callback for each entry.
///
/// The root itself is not reported. Excluded directories are pruned, so the
/// callback never sees anything beneath them. An error from the callback
/// stops the walk and is returned, as does cancellation of `options.cancel`.
pub fn walk_directory_with_callback<F>(
    root: &Path,
    options: &WalkOptions,
    mut callback: F,
) -> std::io::Result<()>
where
    F: FnMut(&FileInfo) -> std::io::Result<()>,
{
    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !should_exclude(entry, root, options));

    for entry in walker {
        if options.cancel.is_cancelled() {
            return Err(std::io::Error::other("walk cancelled"));
        }
        let entry = entry?;
        let file_info = FileInfo::from_entry(&entry, root)?;
        callback(&file_info)?;
    }

    Ok(())
}

/// Walk a directory tree and collect all entries
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut entries = Vec::new();
    walk_directory_with_callback(root, options, |info| {
        entries.push(info.clone());
        Ok(())
    })?;
    Ok(entries)
}

fn should_exclude(entry: &DirEntry, root: &Path, options: &WalkOptions) -> bool {
    if options.skip_paths.iter().any(|skip| skip == entry.path()) {
        return true;
    }

    let relative = match entry.path().strip_prefix(root) {
        Ok(relative) => relative,
        Err(_) => return false,
    };
    options
        .exclusions
        .is_excluded(relative, entry.file_type().is_dir())
}
