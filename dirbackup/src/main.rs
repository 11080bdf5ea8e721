//! backup - entry point
//!
//! `backup <source_dir> <dest_dir> <prefix> [retention_days]`

use anyhow::Result;
use clap::error::ErrorKind;
use clap::Parser;
use dirbackup::daemon::ShutdownCoordinator;
use dirbackup::{utils, BackupError, BackupExecutor, BackupJob, BackupOutcome, Config};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// How long a cancelled backup gets to unwind before the process exits anyway
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "backup", author, version, about, long_about = None)]
struct Args {
    /// Directory to back up
    source_dir: PathBuf,

    /// Existing, writable directory receiving archives
    dest_dir: PathBuf,

    /// Name of the backup target; namespaces archives, lock and ledger entries
    prefix: String,

    /// Delete this prefix's archives after this many days (0 = keep forever)
    #[arg(allow_negative_numbers = true)]
    retention_days: Option<String>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let usage = BackupError::Usage(e.kind().to_string());
            eprintln!("{}\n\n{}", usage, e.render());
            return ExitCode::FAILURE;
        }
    };

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::from_file(path),
        None => Ok(Config::default()),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FAILED: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = utils::logger::init(log_level) {
        eprintln!("FAILED: cannot initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run(args, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("FAILED: {:#}", e);
            tracing::info!("Backup finished at {}", chrono::Local::now().format(TIME_FORMAT));
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, config: Config) -> Result<()> {
    let retention_days = parse_retention(args.retention_days.as_deref(), &config);

    tracing::info!(
        "Backup started at {} (dirbackup v{})",
        chrono::Local::now().format(TIME_FORMAT),
        env!("CARGO_PKG_VERSION")
    );

    let job = BackupJob::new(&args.source_dir, &args.dest_dir, &args.prefix, retention_days)?;
    tracing::info!(
        "Backing up {} to {} as '{}'",
        job.source.display(),
        job.destination.display(),
        job.prefix
    );

    // Handlers go in before the job starts so no signal falls back to the
    // default action mid-run.
    let mut shutdown_coordinator = ShutdownCoordinator::install()?;
    let executor = BackupExecutor::new(config);
    let cleanup = executor.cleanup();
    let cancel = executor.cancel_token();

    // The backup itself is blocking; run it off the async thread so a signal
    // can still be observed while it works.
    let mut handle = tokio::task::spawn_blocking(move || executor.execute(&job));

    let first = tokio::select! {
        joined = &mut handle => Ok(joined),
        signal = shutdown_coordinator.wait_for_signal() => Err(signal?),
    };

    let outcome = match first {
        Ok(joined) => joined??,
        Err(name) => {
            tracing::warn!("Received {}, stopping backup", name);
            cancel.cancel();

            match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(joined) => joined?.map_err(|e| anyhow::anyhow!("{} ({})", e, name))?,
                Err(_) => {
                    let removed = cleanup.run();
                    tracing::error!(
                        "FAILED: backup did not stop within {}s of {}, removed {} file(s)",
                        SHUTDOWN_GRACE.as_secs(),
                        name,
                        removed
                    );
                    // The blocked worker thread would keep the runtime alive.
                    std::process::exit(1);
                }
            }
        }
    };

    match &outcome {
        BackupOutcome::Skipped { digest, .. } => {
            tracing::info!("Digest {} unchanged", digest);
        }
        BackupOutcome::Created { archive, digest, .. } => {
            tracing::info!("Recorded {} {}", digest, archive);
        }
    }
    tracing::info!("Backup finished at {}", chrono::Local::now().format(TIME_FORMAT));

    Ok(())
}

/// Retention from the command line, falling back to the config file.
/// Values that are not a non-negative integer disable rotation.
fn parse_retention(arg: Option<&str>, config: &Config) -> u32 {
    match arg {
        None => config.retention.default_days,
        Some(raw) => raw.trim().parse::<u32>().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid retention_days {:?}, rotation disabled", raw);
            0
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retention() {
        let mut config = Config::default();
        assert_eq!(parse_retention(Some("7"), &config), 7);
        assert_eq!(parse_retention(Some(" 3 "), &config), 3);
        assert_eq!(parse_retention(Some("-1"), &config), 0);
        assert_eq!(parse_retention(Some("week"), &config), 0);
        assert_eq!(parse_retention(None, &config), 0);

        config.retention.default_days = 30;
        assert_eq!(parse_retention(None, &config), 30);
        assert_eq!(parse_retention(Some("0"), &config), 0);
    }

    #[test]
    fn test_argument_count() {
        assert!(Args::try_parse_from(["backup", "/src", "/dst"]).is_err());
        assert!(Args::try_parse_from(["backup", "/src", "/dst", "p", "7", "extra"]).is_err());

        let args = Args::try_parse_from(["backup", "/src", "/dst", "p"]).unwrap();
        assert_eq!(args.prefix, "p");
        assert!(args.retention_days.is_none());
    }
}
