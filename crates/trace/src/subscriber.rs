use std::{
    fs,
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::Level;
use tracing_subscriber::fmt::{time::ChronoLocal, writer::MakeWriterExt};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// -- Errors

#[derive(Debug)]
pub enum TraceInitError {
    AlreadyInstalled(String),
}

impl std::error::Error for TraceInitError {}

impl core::fmt::Display for TraceInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyInstalled(reason) => {
                write!(f, "a global log subscriber is already installed: {reason}")
            }
        }
    }
}

/// `LogOptions` describes where log records go and how verbose they are.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub level: Level,
    pub log_file: Option<PathBuf>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            log_file: None,
        }
    }
}

/// Where records actually end up after [`init`] ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Console,
    ConsoleAndFile(PathBuf),
}

/// Opens `path` for appending, creating it and its parent directories when
/// missing.
pub fn open_log_file(path: &Path) -> io::Result<fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    fs::OpenOptions::new().create(true).append(true).open(path)
}

/// Where records will be written, decided before the subscriber exists.
#[derive(Debug)]
enum Destination {
    Console,
    ConsoleAndFile(PathBuf, fs::File),
    /// The log file was asked for but could not be opened.
    Fallback(PathBuf, io::Error),
}

impl Destination {
    fn target(&self) -> LogTarget {
        match self {
            Self::ConsoleAndFile(path, _) => LogTarget::ConsoleAndFile(path.clone()),
            Self::Console | Self::Fallback(..) => LogTarget::Console,
        }
    }
}

fn choose_destination(log_file: Option<&Path>) -> Destination {
    match log_file {
        None => Destination::Console,
        Some(path) => match open_log_file(path) {
            Ok(file) => Destination::ConsoleAndFile(path.to_path_buf(), file),
            Err(err) => Destination::Fallback(path.to_path_buf(), err),
        },
    }
}

/// Installs the global subscriber.
///
/// Every record is formatted into a single line and handed to each writer in
/// one write, so concurrent connections never interleave within a record. A
/// log file that cannot be opened downgrades to console-only logging instead
/// of failing.
pub fn init(options: &LogOptions) -> Result<LogTarget, TraceInitError> {
    let builder = tracing_subscriber::fmt()
        .with_max_level(options.level)
        .with_timer(ChronoLocal::new(String::from(TIME_FORMAT)))
        .with_target(false);

    let destination = choose_destination(options.log_file.as_deref());
    let target = destination.target();

    let fallback_reason = match destination {
        Destination::ConsoleAndFile(_, file) => {
            builder
                .with_ansi(false)
                .with_writer(io::stdout.and(Mutex::new(file)))
                .try_init()
                .map_err(|err| TraceInitError::AlreadyInstalled(err.to_string()))?;
            None
        }
        Destination::Fallback(path, err) => {
            builder
                .try_init()
                .map_err(|err| TraceInitError::AlreadyInstalled(err.to_string()))?;
            Some((path, err))
        }
        Destination::Console => {
            builder
                .try_init()
                .map_err(|err| TraceInitError::AlreadyInstalled(err.to_string()))?;
            None
        }
    };

    if let Some((path, err)) = fallback_reason {
        crate::warn!(
            "Unable to open log file {}, logging to console only: {}",
            path.display(),
            err
        );
    }

    Ok(target)
}
