//! Tar serialization of a source tree.
//!
//! The same walk feeds both the content digest and the archive, which keeps
//! the two consistent with respect to exclusions and ordering.

use crate::fs::walker::{walk_directory_with_callback, EntryKind, FileInfo, WalkOptions};
use crate::utils::errors::{BackupError, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tar::{Builder, HeaderMode};

/// Summary of a serialized tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub files: usize,
    pub dirs: usize,
    pub symlinks: usize,
    pub bytes: u64,
}

impl TreeStats {
    fn count(&mut self, info: &FileInfo) {
        match info.kind {
            EntryKind::Dir => self.dirs += 1,
            EntryKind::File => {
                self.files += 1;
                self.bytes += info.size;
            }
            EntryKind::Symlink => self.symlinks += 1,
            EntryKind::Other => {}
        }
    }
}

/// Serialize `root` as a tar stream into `sink`.
///
/// `HeaderMode::Deterministic` drops mtimes and ownership from the headers and
/// is used for digesting; `HeaderMode::Complete` keeps full metadata for the
/// archive itself. Returns the sink once the end-of-archive marker is written.
pub fn write_tree<W: Write>(
    sink: W,
    root: &Path,
    options: &WalkOptions,
    mode: HeaderMode,
) -> Result<(W, TreeStats)> {
    let mut builder = new_builder(sink, mode);
    let stats = serialize(root, options, |info| append_entry(&mut builder, info))?;
    let sink = builder
        .into_inner()
        .map_err(|e| BackupError::read(root, e))?;
    Ok((sink, stats))
}

/// Serialize `root` into `archive` with complete headers and, in the same
/// walk, into `digest` with deterministic headers.
///
/// The digest stream then describes exactly the entries that went into the
/// archive, even if the tree changes while the backup runs.
pub fn write_tree_with_digest<A: Write, D: Write>(
    archive: A,
    digest: D,
    root: &Path,
    options: &WalkOptions,
) -> Result<(A, D, TreeStats)> {
    let mut archive = new_builder(archive, HeaderMode::Complete);
    let mut digest = new_builder(digest, HeaderMode::Deterministic);
    let stats = serialize(root, options, |info| {
        append_entry(&mut archive, info)?;
        append_entry(&mut digest, info)
    })?;

    let archive = archive
        .into_inner()
        .map_err(|e| BackupError::read(root, e))?;
    let digest = digest
        .into_inner()
        .map_err(|e| BackupError::read(root, e))?;
    Ok((archive, digest, stats))
}

fn new_builder<W: Write>(sink: W, mode: HeaderMode) -> Builder<W> {
    let mut builder = Builder::new(sink);
    builder.mode(mode);
    builder.follow_symlinks(false);
    builder
}

fn append_entry<W: Write>(builder: &mut Builder<W>, info: &FileInfo) -> std::io::Result<()> {
    match info.kind {
        EntryKind::Dir => builder.append_dir(&info.relative_path, &info.path),
        EntryKind::File | EntryKind::Symlink => {
            builder.append_path_with_name(&info.path, &info.relative_path)
        }
        EntryKind::Other => Ok(()),
    }
}

/// Walk `root`, handing every entry to `append`. Errors name the entry being
/// written when they happened.
fn serialize<F>(root: &Path, options: &WalkOptions, mut append: F) -> Result<TreeStats>
where
    F: FnMut(&FileInfo) -> std::io::Result<()>,
{
    let mut stats = TreeStats::default();
    let mut current = PathBuf::new();

    let walked = walk_directory_with_callback(root, options, |info| {
        current.clone_from(&info.path);
        if info.kind == EntryKind::Other {
            tracing::debug!("Skipping special file {}", info.path.display());
        }
        append(info)?;
        stats.count(info);
        Ok(())
    });

    match walked {
        Ok(()) => Ok(stats),
        Err(_) if options.cancel.is_cancelled() => Err(BackupError::Interrupted),
        Err(e) => {
            let path = if current.as_os_str().is_empty() {
                root.to_path_buf()
            } else {
                current
            };
            Err(BackupError::read(path, e))
        }
    }
}
