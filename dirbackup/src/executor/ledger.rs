//! Append-only hash ledger (`<dest>/hash.log`).
//!
//! One line per archive: `<digest> <archive-filename>`. Lines are never
//! rewritten; the latest line for a prefix wins.

use crate::digest::ContentDigest;
use crate::utils::errors::{BackupError, Result};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub digest: ContentDigest,
    pub archive: String,
}

impl LedgerEntry {
    fn parse(line: &str) -> Option<Self> {
        let (digest, archive) = line.trim_end().split_once(' ')?;
        let archive = archive.trim();
        if archive.is_empty() {
            return None;
        }
        Some(Self {
            digest: digest.parse().ok()?,
            archive: archive.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    /// Ledger stored as `file_name` inside `destination`
    pub fn at(destination: &Path, file_name: &str) -> Self {
        Self {
            path: destination.join(file_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All well-formed entries, oldest first. A missing ledger is empty.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackupError::Ledger(e)),
        };

        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(BackupError::Ledger)?;
            match LedgerEntry::parse(&line) {
                Some(entry) => entries.push(entry),
                None if line.trim().is_empty() => {}
                None => tracing::debug!("Skipping malformed ledger line: {:?}", line),
            }
        }
        Ok(entries)
    }

    /// Digest of the most recent archive for `prefix`
    pub fn latest(&self, prefix: &str) -> Result<Option<ContentDigest>> {
        let marker = format!("{}_", prefix);
        Ok(self
            .entries()?
            .into_iter()
            .rev()
            .find(|entry| entry.archive.starts_with(&marker))
            .map(|entry| entry.digest))
    }

    /// Append one entry as a single write
    pub fn append(&self, digest: &ContentDigest, archive: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(BackupError::Ledger)?;
        let line = format!("{} {}\n", digest, archive);
        file.write_all(line.as_bytes()).map_err(BackupError::Ledger)?;
        file.sync_all().map_err(BackupError::Ledger)?;
        Ok(())
    }
}
