//! Content digest of a source tree.
//!
//! The digest is SHA-256 over a deterministic tar stream of the tree, so it
//! changes when file bytes, names or structure change, and stays the same when
//! only mtimes or ownership do.

use crate::archive::serializer::{write_tree, TreeStats};
use crate::fs::walker::WalkOptions;
use crate::utils::errors::Result;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;

/// Hex length of a digest
pub const DIGEST_HEX_LEN: usize = 64;

/// SHA-256 content digest, stored as lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest(String);

impl ContentDigest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidDigest;

impl fmt::Display for InvalidDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {} hex characters", DIGEST_HEX_LEN)
    }
}

impl std::error::Error for InvalidDigest {}

impl FromStr for ContentDigest {
    type Err = InvalidDigest;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.len() == DIGEST_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(InvalidDigest)
        }
    }
}

/// `Write` sink that hashes everything written to it
#[derive(Clone, Default)]
pub struct HashWriter(Sha256);

impl HashWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> ContentDigest {
        ContentDigest(hex::encode(self.0.finalize()))
    }
}

impl Write for HashWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Compute the digest of `source` with the given walk options.
pub fn hash_tree(source: &Path, options: &WalkOptions) -> Result<(ContentDigest, TreeStats)> {
    let (writer, stats) = write_tree(
        HashWriter::new(),
        source,
        options,
        tar::HeaderMode::Deterministic,
    )?;
    Ok((writer.finish(), stats))
}
