//! Exclusion patterns read from the per-source ignore file.
//!
//! Patterns follow tar's `--exclude` conventions: a pattern without a slash
//! matches any path component at any depth, a pattern with a slash is matched
//! against the path relative to the source root, and a trailing slash limits
//! the pattern to directories.

use crate::utils::errors::{BackupError, Result};
use globset::{GlobBuilder, GlobMatcher};
use std::path::Path;

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    matcher: GlobMatcher,
    anchored: bool,
    dir_only: bool,
}

/// Ordered set of exclusion rules shared by the hasher and the archive builder.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    rules: Vec<Rule>,
}

impl Exclusions {
    /// Empty exclusion set
    pub fn none() -> Self {
        Self::default()
    }

    /// Build an exclusion set from patterns, one per entry.
    ///
    /// Blank entries and `#` comments are skipped.
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut exclusions = Self::default();
        for pattern in patterns {
            exclusions.push(pattern.as_ref())?;
        }
        Ok(exclusions)
    }

    /// Add one pattern to the end of the set
    pub fn push(&mut self, line: &str) -> Result<()> {
        let line = line.trim_end();
        if line.trim().is_empty() || line.starts_with('#') {
            return Ok(());
        }

        let mut body = line.strip_prefix("./").unwrap_or(line);
        let dir_only = body.len() > 1 && body.ends_with('/');
        body = body.trim_end_matches('/');
        let anchored = body.contains('/');
        let body = body.trim_start_matches('/');

        let matcher = GlobBuilder::new(body)
            .literal_separator(true)
            .build()
            .map_err(|e| BackupError::Preflight(format!("invalid exclude pattern {:?}: {}", line, e)))?
            .compile_matcher();

        self.rules.push(Rule {
            pattern: line.to_string(),
            matcher,
            anchored,
            dir_only,
        });
        Ok(())
    }

    /// Patterns in the order they were added
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.pattern.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Check a path relative to the source root.
    ///
    /// Only the entry itself is tested; callers walking a tree prune excluded
    /// directories so their contents are never visited.
    pub fn is_excluded(&self, relative: &Path, is_dir: bool) -> bool {
        self.rules.iter().any(|rule| {
            if rule.dir_only && !is_dir {
                return false;
            }
            if rule.anchored {
                rule.matcher.is_match(relative)
            } else {
                relative
                    .file_name()
                    .map(|name| rule.matcher.is_match(Path::new(name)))
                    .unwrap_or(false)
            }
        })
    }
}

/// Resolve the exclusion set for a source directory.
///
/// Reads `<source>/<ignore_file>` if it exists; a missing file yields an empty
/// set.
pub fn resolve(source: &Path, ignore_file: &str) -> Result<Exclusions> {
    let path = source.join(ignore_file);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Exclusions::none()),
        Err(e) => return Err(BackupError::read(path, e)),
    };

    let exclusions = Exclusions::from_patterns(content.lines())?;
    tracing::debug!(
        "Loaded {} exclude pattern(s) from {}",
        exclusions.len(),
        path.display()
    );
    Ok(exclusions)
}
