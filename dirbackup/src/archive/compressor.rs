//! Stream compressors for archive output.
//!
//! External tools are preferred when installed: `zstd` first, `xz` as the
//! fallback. The zstd crate's encoder is the last resort so a host with
//! neither binary can still produce archives.

use crate::config::CompressionConfig;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How often a finishing external compressor is polled for exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A compressor writing a compressed stream into an output file.
pub trait Compressor: fmt::Debug + Send + Sync {
    /// Short name used in log lines
    fn name(&self) -> &str;

    /// Archive file extension, without the leading dot
    fn extension(&self) -> &str;

    /// Start compressing into `output`.
    fn start(&self, output: File) -> io::Result<Box<dyn CompressStream>>;
}

/// Writable end of a running compressor.
pub trait CompressStream: Write + Send {
    /// Flush all remaining data and wait for the compressor to finish.
    ///
    /// Cancelling `cancel` while waiting stops the compressor and returns an
    /// error.
    fn finish(self: Box<Self>, cancel: &CancellationToken) -> io::Result<()>;
}

/// Runs an external program reading stdin and writing stdout.
#[derive(Debug, Clone)]
pub struct CommandCompressor {
    name: String,
    program: PathBuf,
    args: Vec<OsString>,
    extension: String,
}

impl CommandCompressor {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I, extension: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = program.into();
        let name = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());
        Self {
            name,
            program,
            args: args.into_iter().map(|a| a.as_ref().to_os_string()).collect(),
            extension: extension.to_string(),
        }
    }

    /// `zstd -q -T<threads> -<level> -c`
    pub fn zstd(program: impl Into<PathBuf>, config: &CompressionConfig) -> Self {
        Self::new(
            program,
            [
                "-q".to_string(),
                format!("-T{}", config.threads),
                format!("-{}", config.level),
                "-c".to_string(),
            ],
            "tar.zst",
        )
    }

    /// `xz -q -T<threads> -c`
    pub fn xz(program: impl Into<PathBuf>, config: &CompressionConfig) -> Self {
        Self::new(
            program,
            ["-q".to_string(), format!("-T{}", config.threads), "-c".to_string()],
            "tar.xz",
        )
    }
}

impl Compressor for CommandCompressor {
    fn name(&self) -> &str {
        &self.name
    }

    fn extension(&self) -> &str {
        &self.extension
    }

    fn start(&self, output: File) -> io::Result<Box<dyn CompressStream>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(output))
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("compressor stdin unavailable"))?;

        Ok(Box::new(ChildStream {
            name: self.name.clone(),
            stdin: Some(stdin),
            child: Some(child),
        }))
    }
}

struct ChildStream {
    name: String,
    stdin: Option<ChildStdin>,
    child: Option<Child>,
}

impl Write for ChildStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write(buf),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

impl CompressStream for ChildStream {
    fn finish(mut self: Box<Self>, cancel: &CancellationToken) -> io::Result<()> {
        // Closing stdin signals end of input.
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if cancel.is_cancelled() {
                debug!("Stopping {} (pid {})", self.name, child.id());
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::other(format!("{} cancelled", self.name)));
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        };
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("{} exited with {}", self.name, status)))
        }
    }
}

impl Drop for ChildStream {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// In-process zstd encoder
#[derive(Debug, Clone)]
pub struct BuiltinZstd {
    level: i32,
}

impl BuiltinZstd {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Compressor for BuiltinZstd {
    fn name(&self) -> &str {
        "zstd (built-in)"
    }

    fn extension(&self) -> &str {
        "tar.zst"
    }

    fn start(&self, output: File) -> io::Result<Box<dyn CompressStream>> {
        let encoder = zstd::stream::write::Encoder::new(output, self.level)?;
        Ok(Box::new(EncoderStream(encoder)))
    }
}

struct EncoderStream(zstd::stream::write::Encoder<'static, File>);

impl Write for EncoderStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl CompressStream for EncoderStream {
    fn finish(self: Box<Self>, _cancel: &CancellationToken) -> io::Result<()> {
        let mut file = self.0.finish()?;
        file.flush()
    }
}

/// Pick a compressor for this host.
///
/// `search_path` is a `PATH`-style list; `None` uses the process `PATH`.
pub fn select(config: &CompressionConfig, search_path: Option<&OsStr>) -> Box<dyn Compressor> {
    let path_var = search_path
        .map(OsStr::to_os_string)
        .or_else(|| std::env::var_os("PATH"))
        .unwrap_or_default();

    if let Some(program) = find_program("zstd", &path_var) {
        return Box::new(CommandCompressor::zstd(program, config));
    }
    if let Some(program) = find_program("xz", &path_var) {
        warn!("zstd not found in PATH, falling back to xz (slower)");
        return Box::new(CommandCompressor::xz(program, config));
    }
    warn!("Neither zstd nor xz found in PATH, using built-in zstd encoder");
    Box::new(BuiltinZstd::new(config.level))
}

/// Look up an executable by name in a `PATH`-style list
pub fn find_program(name: &str, path_var: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
