//! Archive builder - packs a source tree into a compressed tarball.
//!
//! Output is written to a hidden temporary file in the destination directory
//! and only moved to `<prefix>_<YYYYMMDDHHMMSS>.<ext>` once the compressor has
//! exited successfully. A failed or cancelled build removes the temporary
//! file, so a file at the final name is always a complete archive.

pub mod compressor;
pub mod serializer;

use crate::daemon::shutdown::CleanupRegistry;
use crate::digest::{ContentDigest, HashWriter};
use crate::executor::BackupJob;
use crate::fs::walker::WalkOptions;
use crate::utils::errors::{BackupError, Result};
use chrono::NaiveDateTime;
use compressor::Compressor;
use serializer::{write_tree_with_digest, TreeStats};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Timestamp format embedded in archive names
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// A finished archive at its final path
#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub file_name: String,
    pub path: PathBuf,
    /// Digest of the entries written to this archive
    pub digest: ContentDigest,
    pub compressed_bytes: u64,
}

pub struct ArchiveBuilder {
    compressor: Arc<dyn Compressor>,
}

impl ArchiveBuilder {
    pub fn new(compressor: Arc<dyn Compressor>) -> Self {
        Self { compressor }
    }

    /// `<prefix>_<YYYYMMDDHHMMSS>.<ext>`
    pub fn archive_name(&self, prefix: &str, timestamp: NaiveDateTime) -> String {
        format!(
            "{}_{}.{}",
            prefix,
            timestamp.format(TIMESTAMP_FORMAT),
            self.compressor.extension()
        )
    }

    /// Build an archive of `job.source` into `job.destination`.
    pub fn build(
        &self,
        job: &BackupJob,
        options: &WalkOptions,
        timestamp: NaiveDateTime,
        cleanup: &CleanupRegistry,
    ) -> Result<BuiltArchive> {
        let file_name = self.archive_name(&job.prefix, timestamp);
        let final_path = job.destination.join(&file_name);
        if final_path.exists() {
            return Err(BackupError::Build(format!(
                "{} already exists",
                final_path.display()
            )));
        }

        let temp_prefix = format!(".{}.", file_name);
        let mut temp_builder = tempfile::Builder::new();
        temp_builder.prefix(&temp_prefix).suffix(".partial");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // Same mode a shell redirect would give; the umask still applies.
            temp_builder.permissions(std::fs::Permissions::from_mode(0o644));
        }
        let temp = temp_builder
            .tempfile_in(&job.destination)
            .map_err(|e| BackupError::Build(format!("cannot create temporary file: {}", e)))?;
        cleanup.register(temp.path());
        debug!("Writing {} via {}", temp.path().display(), self.compressor.name());

        let written = self.write_compressed(temp.as_file(), job, options);
        cleanup.unregister(temp.path());
        // Dropping `temp` on the error path deletes the partial file.
        let (digest, stats) = written?;
        if options.cancel.is_cancelled() {
            return Err(BackupError::Interrupted);
        }

        temp.as_file()
            .sync_all()
            .map_err(|e| BackupError::Build(format!("sync failed: {}", e)))?;
        let file = temp
            .persist_noclobber(&final_path)
            .map_err(|e| BackupError::Build(format!("cannot move archive into place: {}", e.error)))?;
        let compressed_bytes = file.metadata().map(|m| m.len()).unwrap_or(0);

        info!(
            "Archived {} files ({} bytes) into {} ({} bytes, {})",
            stats.files,
            stats.bytes,
            file_name,
            compressed_bytes,
            self.compressor.name()
        );

        Ok(BuiltArchive {
            file_name,
            path: final_path,
            digest,
            compressed_bytes,
        })
    }

    fn write_compressed(
        &self,
        output: &std::fs::File,
        job: &BackupJob,
        options: &WalkOptions,
    ) -> Result<(ContentDigest, TreeStats)> {
        let output = output
            .try_clone()
            .map_err(|e| BackupError::Build(e.to_string()))?;
        let stream = self
            .compressor
            .start(output)
            .map_err(|e| BackupError::Build(format!("cannot start {}: {}", self.compressor.name(), e)))?;

        let (stream, hasher, stats) =
            write_tree_with_digest(stream, HashWriter::new(), &job.source, options).map_err(
                |e| match e {
                    BackupError::Interrupted => e,
                    e => BackupError::Build(e.to_string()),
                },
            )?;
        stream.finish(&options.cancel).map_err(|e| {
            if options.cancel.is_cancelled() {
                BackupError::Interrupted
            } else {
                BackupError::Build(e.to_string())
            }
        })?;
        Ok((hasher.finish(), stats))
    }
}
