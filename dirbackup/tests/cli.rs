//! End-to-end tests for the `backup` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

struct Fixture {
    source: TempDir,
    dest: TempDir,
    /// Empty PATH so compressor selection is the same on every host
    bin: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let source = TempDir::new().unwrap();
        fs::write(source.path().join("index.html"), "<h1>home</h1>").unwrap();
        fs::create_dir(source.path().join("img")).unwrap();
        fs::write(source.path().join("img/logo.png"), [0u8, 1, 2, 3]).unwrap();
        Self {
            source,
            dest: TempDir::new().unwrap(),
            bin: TempDir::new().unwrap(),
        }
    }

    fn backup(&self, extra: &[&str]) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_backup"));
        cmd.env("PATH", self.bin.path())
            .env_remove("RUST_LOG")
            .arg(self.source.path())
            .arg(self.dest.path())
            .arg("site")
            .args(extra);
        cmd
    }

    fn archives(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.dest.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("site_"))
            .collect();
        names.sort();
        names
    }

    fn ledger(&self) -> Vec<String> {
        fs::read_to_string(self.dest.path().join("hash.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn lock(&self) -> std::path::PathBuf {
        self.dest.path().join("site.lock")
    }
}

fn set_age(path: &Path, age: Duration) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - age).unwrap();
}

#[test]
fn test_wrong_argument_count_is_usage_error() {
    Command::new(env!("CARGO_BIN_EXE_backup"))
        .arg("/tmp")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_help_exits_zero() {
    Command::new(env!("CARGO_BIN_EXE_backup"))
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("retention_days").or(predicate::str::contains("RETENTION_DAYS")));
}

#[test]
fn test_missing_source_fails_before_locking() {
    let fixture = Fixture::new();
    let missing = fixture.source.path().join("nope");

    Command::new(env!("CARGO_BIN_EXE_backup"))
        .env("PATH", fixture.bin.path())
        .arg(&missing)
        .arg(fixture.dest.path())
        .arg("site")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("does not exist"));

    assert!(!fixture.lock().exists());
    assert!(fixture.archives().is_empty());
}

#[test]
fn test_unchanged_tree_is_skipped() {
    let fixture = Fixture::new();

    fixture
        .backup(&[])
        .assert()
        .success()
        .stdout(predicate::str::contains("SUCCESS"))
        .stderr(predicate::str::contains("built-in zstd"));

    fixture
        .backup(&[])
        .assert()
        .success()
        .stdout(predicate::str::contains("SKIPPED"));

    let archives = fixture.archives();
    assert_eq!(archives.len(), 1);
    assert!(archives[0].ends_with(".tar.zst"));
    assert_eq!(fixture.ledger().len(), 1);
    assert!(fixture.ledger()[0].ends_with(&archives[0]));
    assert!(!fixture.lock().exists());
}

#[test]
fn test_changed_tree_gets_new_archive() {
    let fixture = Fixture::new();
    fixture.backup(&[]).assert().success();
    let first_line = fixture.ledger()[0].clone();

    // Archive names have one-second resolution.
    std::thread::sleep(Duration::from_millis(1100));
    fs::write(fixture.source.path().join("index.html"), "<h1>home!</h1>").unwrap();

    fixture
        .backup(&[])
        .assert()
        .success()
        .stdout(predicate::str::contains("SUCCESS"));

    assert_eq!(fixture.archives().len(), 2);
    let ledger = fixture.ledger();
    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger[0], first_line);
    assert_ne!(ledger[0].split(' ').next(), ledger[1].split(' ').next());
}

#[test]
fn test_live_lock_blocks_second_invocation() {
    let fixture = Fixture::new();
    // This test process is alive for the duration of the run.
    let holder = std::process::id().to_string();
    fs::write(fixture.lock(), &holder).unwrap();

    fixture
        .backup(&[])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("already running"));

    assert_eq!(fs::read_to_string(fixture.lock()).unwrap(), holder);
    assert!(fixture.archives().is_empty());
    assert!(fixture.ledger().is_empty());
}

#[test]
fn test_stale_lock_is_recovered() {
    let fixture = Fixture::new();
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead = child.id();
    child.wait().unwrap();
    fs::write(fixture.lock(), dead.to_string()).unwrap();

    fixture
        .backup(&[])
        .assert()
        .success()
        .stderr(predicate::str::contains("stale lock"));

    assert_eq!(fixture.archives().len(), 1);
    assert!(!fixture.lock().exists());
}

#[test]
fn test_retention_removes_only_expired_archives() {
    let fixture = Fixture::new();
    let survivor = fixture.dest.path().join("site_20200101000000.tar.zst");
    let expired = fixture.dest.path().join("site_20190101000000.tar.xz");
    let other = fixture.dest.path().join("blog_20190101000000.tar.zst");
    for path in [&survivor, &expired, &other] {
        fs::write(path, b"old").unwrap();
    }
    set_age(&survivor, Duration::from_secs(6 * 86_400 + 600));
    set_age(&expired, Duration::from_secs(7 * 86_400 + 600));
    set_age(&other, Duration::from_secs(90 * 86_400));

    fixture.backup(&["7"]).assert().success();

    assert!(survivor.exists());
    assert!(!expired.exists());
    assert!(other.exists());
    assert_eq!(fixture.archives().len(), 2);
}

#[test]
fn test_invalid_retention_disables_rotation() {
    let fixture = Fixture::new();
    let old = fixture.dest.path().join("site_20190101000000.tar.zst");
    fs::write(&old, b"old").unwrap();
    set_age(&old, Duration::from_secs(365 * 86_400));

    fixture
        .backup(&["soon"])
        .assert()
        .success()
        .stderr(predicate::str::contains("invalid retention_days"));

    assert!(old.exists());
}

#[test]
fn test_ignore_file_is_respected() {
    let fixture = Fixture::new();
    fs::write(fixture.source.path().join(".backupignore"), "img\n").unwrap();
    fixture.backup(&[]).assert().success();

    fs::write(fixture.source.path().join("img/logo.png"), [9u8; 16]).unwrap();
    fixture
        .backup(&[])
        .assert()
        .success()
        .stdout(predicate::str::contains("SKIPPED"));
    assert_eq!(fixture.archives().len(), 1);
}

#[test]
#[cfg(unix)]
fn test_falls_back_to_xz_when_zstd_missing() {
    use std::os::unix::fs::PermissionsExt;

    let fixture = Fixture::new();
    let fake_xz = fixture.bin.path().join("xz");
    fs::write(&fake_xz, "#!/bin/sh\nexec /bin/cat\n").unwrap();
    fs::set_permissions(&fake_xz, fs::Permissions::from_mode(0o755)).unwrap();

    fixture
        .backup(&[])
        .assert()
        .success()
        .stderr(predicate::str::contains("falling back to xz"));

    let archives = fixture.archives();
    assert_eq!(archives.len(), 1);
    assert!(archives[0].ends_with(".tar.xz"));
}

#[test]
#[cfg(unix)]
fn test_failing_compressor_leaves_no_partial_archive() {
    use std::os::unix::fs::PermissionsExt;

    let fixture = Fixture::new();
    let broken = fixture.bin.path().join("zstd");
    fs::write(&broken, "#!/bin/sh\n/bin/cat >/dev/null\nprintf partial\nexit 1\n").unwrap();
    fs::set_permissions(&broken, fs::Permissions::from_mode(0o755)).unwrap();

    fixture
        .backup(&[])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("FAILED"));

    let leftovers: Vec<_> = fs::read_dir(fixture.dest.path()).unwrap().collect();
    assert!(leftovers.is_empty());
}

#[test]
#[cfg(unix)]
fn test_sigterm_stops_backup_and_releases_lock() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use std::os::unix::fs::PermissionsExt;
    use std::process::Stdio;
    use std::time::Instant;

    let fixture = Fixture::new();
    let stalled = fixture.bin.path().join("zstd");
    fs::write(&stalled, "#!/bin/sh\nexec /bin/sleep 30\n").unwrap();
    fs::set_permissions(&stalled, fs::Permissions::from_mode(0o755)).unwrap();

    let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_backup"))
        .env("PATH", fixture.bin.path())
        .env_remove("RUST_LOG")
        .arg(fixture.source.path())
        .arg(fixture.dest.path())
        .arg("site")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    // Wait until the archive is being written.
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let building = fs::read_dir(fixture.dest.path())
            .unwrap()
            .any(|e| e.unwrap().file_name().to_string_lossy().ends_with(".partial"));
        if building {
            break;
        }
        assert!(Instant::now() < deadline, "backup never started building");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(fixture.lock().exists());

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();

    let deadline = Instant::now() + Duration::from_secs(8);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        assert!(Instant::now() < deadline, "backup kept running after SIGTERM");
        std::thread::sleep(Duration::from_millis(20));
    };
    let output = child.wait_with_output().unwrap();

    assert_eq!(status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("interrupted"));
    assert!(!fixture.lock().exists());
    assert!(fixture.archives().is_empty());
    assert!(fixture.ledger().is_empty());
    let leftovers: Vec<_> = fs::read_dir(fixture.dest.path()).unwrap().collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_config_file_changes_ledger_name() {
    let fixture = Fixture::new();
    let config = fixture.bin.path().join("backup.toml");
    fs::write(&config, "[files]\nledger_file = \"digests.log\"\n").unwrap();

    fixture
        .backup(&["--config", config.to_str().unwrap()])
        .assert()
        .success();

    assert!(fixture.dest.path().join("digests.log").exists());
    assert!(!fixture.dest.path().join("hash.log").exists());
}
