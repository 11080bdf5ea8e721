//! Age-based rotation of old archives.
//!
//! Age is counted in whole days, rounded down, the same way `find -mtime`
//! does. With a retention of N days an archive is removed once it is N whole
//! days old, so one created today survives for N calendar days.

use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

const SECONDS_PER_DAY: u64 = 86_400;

/// Outcome of a rotation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub removed: usize,
    pub failed: usize,
    pub kept: usize,
}

/// True for `<prefix>_*.tar.*`
pub fn is_archive_for(file_name: &str, prefix: &str) -> bool {
    file_name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|rest| rest.find(".tar.").map(|idx| idx + ".tar.".len() < rest.len()))
        .unwrap_or(false)
}

/// Whole days between `modified` and `now`; future mtimes count as 0.
fn age_in_days(modified: SystemTime, now: SystemTime) -> u64 {
    now.duration_since(modified)
        .unwrap_or(Duration::ZERO)
        .as_secs()
        / SECONDS_PER_DAY
}

/// True when an archive of this age falls outside the window
pub fn is_expired(age_days: u64, retention_days: u32) -> bool {
    retention_days > 0 && age_days > u64::from(retention_days) - 1
}

/// Delete archives for `prefix` older than the retention window.
///
/// Does nothing when `retention_days` is 0. Errors are logged and counted,
/// never returned.
pub fn enforce(destination: &Path, prefix: &str, retention_days: u32) -> RetentionReport {
    enforce_at(destination, prefix, retention_days, SystemTime::now())
}

pub fn enforce_at(
    destination: &Path,
    prefix: &str,
    retention_days: u32,
    now: SystemTime,
) -> RetentionReport {
    let mut report = RetentionReport::default();
    if retention_days == 0 {
        return report;
    }

    let entries = match std::fs::read_dir(destination) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Retention: cannot list {}: {}", destination.display(), e);
            report.failed += 1;
            return report;
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !is_archive_for(&name, prefix) {
            continue;
        }

        let modified = match entry.metadata() {
            Ok(meta) if meta.is_file() => meta.modified(),
            Ok(_) => continue,
            Err(e) => Err(e),
        };
        let modified = match modified {
            Ok(modified) => modified,
            Err(e) => {
                warn!("Retention: cannot stat {}: {}", name, e);
                report.failed += 1;
                continue;
            }
        };

        let age = age_in_days(modified, now);
        if !is_expired(age, retention_days) {
            report.kept += 1;
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                info!("Removed old archive {} ({} days old)", name, age);
                report.removed += 1;
            }
            Err(e) => {
                warn!("Retention: failed to remove {}: {}", name, e);
                report.failed += 1;
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(SECONDS_PER_DAY);
    const HOUR: Duration = Duration::from_secs(3_600);

    fn archive_aged(dir: &Path, name: &str, age: Duration, now: SystemTime) -> std::io::Result<()> {
        let path = dir.join(name);
        let file = fs::File::create(&path)?;
        file.set_modified(now - age)?;
        Ok(())
    }

    #[test]
    fn test_pattern() {
        assert!(is_archive_for("docs_20260101000000.tar.zst", "docs"));
        assert!(is_archive_for("docs_20260101000000.tar.xz", "docs"));
        assert!(!is_archive_for("docs_20260101000000.tar.", "docs"));
        assert!(!is_archive_for("docs_20260101000000.zip", "docs"));
        assert!(!is_archive_for("docs.lock", "docs"));
        assert!(!is_archive_for("photos_20260101000000.tar.zst", "docs"));
        assert!(!is_archive_for("docsx_20260101000000.tar.zst", "docs"));
    }

    #[test]
    fn test_expiry_boundary() {
        assert!(!is_expired(5, 7));
        assert!(!is_expired(6, 7));
        assert!(is_expired(7, 7));
        assert!(!is_expired(0, 1));
        assert!(is_expired(1, 1));
        assert!(!is_expired(1000, 0));
    }

    #[test]
    fn test_seven_day_window() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let now = SystemTime::now();

        archive_aged(dir.path(), "docs_a.tar.zst", 6 * DAY + HOUR, now)?;
        archive_aged(dir.path(), "docs_b.tar.zst", 7 * DAY + HOUR, now)?;
        archive_aged(dir.path(), "docs_c.tar.xz", 30 * DAY, now)?;
        archive_aged(dir.path(), "docs_d.tar.zst", HOUR, now)?;

        let report = enforce_at(dir.path(), "docs", 7, now);
        assert_eq!(report.removed, 2);
        assert_eq!(report.kept, 2);
        assert_eq!(report.failed, 0);
        assert!(dir.path().join("docs_a.tar.zst").exists());
        assert!(!dir.path().join("docs_b.tar.zst").exists());
        assert!(!dir.path().join("docs_c.tar.xz").exists());
        assert!(dir.path().join("docs_d.tar.zst").exists());
        Ok(())
    }

    #[test]
    fn test_only_matching_files_are_touched() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let now = SystemTime::now();

        archive_aged(dir.path(), "photos_old.tar.zst", 90 * DAY, now)?;
        archive_aged(dir.path(), "hash.log", 90 * DAY, now)?;
        archive_aged(dir.path(), "docs_notes.txt", 90 * DAY, now)?;
        fs::create_dir(dir.path().join("docs_dir.tar.d"))?;

        let report = enforce_at(dir.path(), "docs", 1, now);
        assert_eq!(report, RetentionReport::default());
        assert!(dir.path().join("photos_old.tar.zst").exists());
        assert!(dir.path().join("hash.log").exists());
        assert!(dir.path().join("docs_notes.txt").exists());
        Ok(())
    }

    #[test]
    fn test_zero_days_disables_rotation() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let now = SystemTime::now();
        archive_aged(dir.path(), "docs_old.tar.zst", 365 * DAY, now)?;

        assert_eq!(enforce_at(dir.path(), "docs", 0, now), RetentionReport::default());
        assert!(dir.path().join("docs_old.tar.zst").exists());
        Ok(())
    }

    #[test]
    fn test_missing_destination_is_not_fatal() {
        let report = enforce(Path::new("/nonexistent/dirbackup-dest"), "docs", 7);
        assert_eq!(report.failed, 1);
    }
}
