use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Suffix appended to every artifact file name
pub const ARTIFACT_SUFFIX: &str = "bz2";

/// Backends write here first; only a finished artifact is renamed into place
pub const PARTIAL_SUFFIX: &str = ".partial";

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("no usable compression backend found")]
    NoBackend,

    #[error("failed to create destination directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to launch {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("{program} exited with {status}: {stderr}")]
    ToolFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} reported success but {path} was not written")]
    MissingOutput { program: String, path: PathBuf },
}

/// Compresses one file into one artifact.
///
/// Implementations create the destination directory, always overwrite, and
/// never leave a partial artifact at `destination`, even when the process
/// dies mid-write.
pub trait Compress: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn compress(&self, source: &Path, destination: &Path) -> Result<(), CompressionError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    /// `bzip2 -c -1`
    NativeBzip2 { program: PathBuf },
    /// `7z a -tbzip2 -mx=1`
    SevenZip { program: PathBuf },
    /// In-process encoder from the `bzip2` crate
    Builtin,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::NativeBzip2 { program } => write!(f, "bzip2 ({})", program.display()),
            BackendKind::SevenZip { program } => write!(f, "7-Zip ({})", program.display()),
            BackendKind::Builtin => write!(f, "built-in bzip2"),
        }
    }
}

/// Which backends this host can use, in probe order.
#[derive(Debug, Clone)]
pub struct BackendReport {
    pub native_bzip2: Option<PathBuf>,
    pub seven_zip: Option<PathBuf>,
    pub builtin: bool,
}

impl BackendReport {
    pub fn probe() -> Self {
        let native_bzip2 = if cfg!(windows) {
            None
        } else {
            find_program("bzip2")
        };

        Self {
            native_bzip2,
            seven_zip: find_seven_zip(),
            builtin: cfg!(feature = "builtin-bzip2"),
        }
    }

    /// Fast native tool first, built-in encoder last.
    pub fn preferred(&self) -> Option<BackendKind> {
        if let Some(program) = &self.native_bzip2 {
            return Some(BackendKind::NativeBzip2 {
                program: program.clone(),
            });
        }
        if let Some(program) = &self.seven_zip {
            return Some(BackendKind::SevenZip {
                program: program.clone(),
            });
        }
        self.builtin.then_some(BackendKind::Builtin)
    }

    pub fn log(&self) {
        info!("Compression tools:");
        info!("  bzip2:    {}", describe(&self.native_bzip2));
        info!("  7-Zip:    {}", describe(&self.seven_zip));
        info!(
            "  built-in: {}",
            if self.builtin { "available" } else { "disabled" }
        );
    }
}

fn describe(program: &Option<PathBuf>) -> String {
    match program {
        Some(path) => format!("available ({})", path.display()),
        None => "not found".to_string(),
    }
}

/// The compression backend selected at startup.
#[derive(Debug, Clone)]
pub struct Backend {
    kind: BackendKind,
    timeout: Duration,
}

impl Backend {
    /// Probe the host and pick the first usable backend.
    pub fn detect(timeout: Duration) -> Result<Self, CompressionError> {
        Self::from_report(&BackendReport::probe(), timeout)
    }

    pub fn from_report(report: &BackendReport, timeout: Duration) -> Result<Self, CompressionError> {
        let kind = report.preferred().ok_or(CompressionError::NoBackend)?;
        Ok(Self { kind, timeout })
    }

    pub fn with_kind(kind: BackendKind, timeout: Duration) -> Self {
        Self { kind, timeout }
    }

    fn run_native_bzip2(&self, program: &Path, source: &Path, destination: &Path) -> Result<(), CompressionError> {
        let output = File::create(destination).map_err(io_error(destination))?;

        let mut cmd = tool_command(program);
        cmd.args(["-c", "-1"])
            .arg(source)
            .stdout(Stdio::from(output))
            .stderr(Stdio::piped());

        run_with_timeout(cmd, program, self.timeout)
    }

    fn run_seven_zip(&self, program: &Path, source: &Path, destination: &Path) -> Result<(), CompressionError> {
        // 7z appends to an existing archive instead of replacing it
        if destination.exists() {
            fs::remove_file(destination).map_err(io_error(destination))?;
        }

        let mut cmd = tool_command(program);
        cmd.args(["a", "-tbzip2", "-mx=1", "-y", "-bso0", "-bsp0"])
            .arg(destination)
            .arg(source)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        run_with_timeout(cmd, program, self.timeout)
    }

    #[cfg(feature = "builtin-bzip2")]
    fn run_builtin(&self, source: &Path, destination: &Path) -> Result<(), CompressionError> {
        use bzip2::write::BzEncoder;
        use bzip2::Compression;
        use std::io::{BufReader, BufWriter, Write};

        let input = File::open(source).map_err(io_error(source))?;
        let output = File::create(destination).map_err(io_error(destination))?;

        let mut encoder = BzEncoder::new(BufWriter::new(output), Compression::fast());
        io::copy(&mut BufReader::new(input), &mut encoder).map_err(io_error(destination))?;
        let mut writer = encoder.finish().map_err(io_error(destination))?;
        writer.flush().map_err(io_error(destination))
    }

    #[cfg(not(feature = "builtin-bzip2"))]
    fn run_builtin(&self, _source: &Path, _destination: &Path) -> Result<(), CompressionError> {
        Err(CompressionError::NoBackend)
    }
}

impl Compress for Backend {
    fn kind(&self) -> BackendKind {
        self.kind.clone()
    }

    fn compress(&self, source: &Path, destination: &Path) -> Result<(), CompressionError> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|source| CompressionError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        // Left over when a previous run was killed mid-write
        let partial = partial_path(destination);
        discard_partial(&partial);

        let result = match &self.kind {
            BackendKind::NativeBzip2 { program } => self.run_native_bzip2(program, source, &partial),
            BackendKind::SevenZip { program } => self.run_seven_zip(program, source, &partial),
            BackendKind::Builtin => self.run_builtin(source, &partial),
        }
        .and_then(|()| {
            if partial.is_file() {
                Ok(())
            } else {
                Err(CompressionError::MissingOutput {
                    program: self.kind.to_string(),
                    path: partial.clone(),
                })
            }
        })
        .and_then(|()| fs::rename(&partial, destination).map_err(io_error(destination)));

        if result.is_err() {
            discard_partial(&partial);
        }
        result
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CompressionError {
    let path = path.to_path_buf();
    move |source| CompressionError::Io { path, source }
}

/// `<destination>.partial`
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut path = destination.as_os_str().to_owned();
    path.push(PARTIAL_SUFFIX);
    PathBuf::from(path)
}

fn discard_partial(partial: &Path) {
    match fs::remove_file(partial) {
        Ok(()) => debug!("Removed partial artifact {}", partial.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial artifact {}: {}", partial.display(), e),
    }
}

/// External tools run in their own process group so a Ctrl+C from the
/// terminal reaches only us; the batch in flight is allowed to finish.
fn tool_command(program: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd
}

/// Wait for `cmd`, killing it once `timeout` elapses.
fn run_with_timeout(mut cmd: Command, program: &Path, timeout: Duration) -> Result<(), CompressionError> {
    let name = program.display().to_string();
    debug!("Running {:?}", cmd);

    let mut child = cmd.spawn().map_err(|source| CompressionError::Spawn {
        program: name.clone(),
        source,
    })?;

    // Drain stderr on its own thread so a chatty tool cannot fill the pipe
    let stderr_reader = child.stderr.take().map(|mut stderr| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf);
            buf
        })
    });
    let collect_stderr = |reader: Option<thread::JoinHandle<String>>| {
        reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
            .trim()
            .to_string()
    };

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) if status.success() => {
                let _ = collect_stderr(stderr_reader);
                return Ok(());
            }
            Ok(Some(status)) => {
                return Err(CompressionError::ToolFailed {
                    program: name,
                    status: status.to_string(),
                    stderr: collect_stderr(stderr_reader),
                });
            }
            Ok(None) if started.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = collect_stderr(stderr_reader);
                return Err(CompressionError::Timeout { program: name, timeout });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(source) => {
                let _ = child.kill();
                return Err(CompressionError::Io {
                    path: program.to_path_buf(),
                    source,
                });
            }
        }
    }
}

// Tool availability does not change while we run
static PROGRAM_CACHE: Lazy<Mutex<HashMap<String, Option<PathBuf>>>> = Lazy::new(Default::default);

/// Look `name` up on PATH, caching the answer for the process lifetime.
pub fn find_program(name: &str) -> Option<PathBuf> {
    if let Some(hit) = PROGRAM_CACHE.lock().get(name) {
        return hit.clone();
    }

    let found = search_path(name);
    debug!("PATH lookup for {}: {:?}", name, found);
    PROGRAM_CACHE.lock().insert(name.to_string(), found.clone());
    found
}

fn search_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(windows)]
fn find_seven_zip() -> Option<PathBuf> {
    find_program("7z.exe").or_else(|| {
        [
            r"C:\Program Files\7-Zip\7z.exe",
            r"C:\Program Files (x86)\7-Zip\7z.exe",
        ]
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
    })
}

#[cfg(not(windows))]
fn find_seven_zip() -> Option<PathBuf> {
    find_program("7z").or_else(|| find_program("7za"))
}
