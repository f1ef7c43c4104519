// Loading of raw test case payloads from a directory, a zip archive or a
// single file.

use core::fmt;
use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
};

use bytes::Bytes;

use crate::config::{SourceConfig, SourcePlan};

/// Names ending with this suffix ask for the connection to stay open after
/// the payload was sent.
pub const KEEP_OPEN_SUFFIX: &str = ".keep";

// -- Errors

#[derive(Debug)]
pub enum LoadError {
    SourceNotFound(PathBuf),
    EmptyTestSet(String),
    LoadIO { path: String, source: io::Error },
    InvalidArchive { path: PathBuf, reason: String },
    DuplicateTestCase(String),
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::LoadIO { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl core::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceNotFound(path) => {
                write!(f, "test case source {} not found", path.display())
            }
            Self::EmptyTestSet(source) => write!(f, "no test cases found in {source}"),
            Self::LoadIO { path, source } => write!(f, "failed to read {path}: {source}"),
            Self::InvalidArchive { path, reason } => {
                write!(f, "{} is not a valid zip file: {reason}", path.display())
            }
            Self::DuplicateTestCase(name) => {
                write!(f, "more than one test case is named {name}")
            }
        }
    }
}

fn read_failure(path: impl Into<String>, source: io::Error) -> LoadError {
    LoadError::LoadIO {
        path: path.into(),
        source,
    }
}

// -- Test cases

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosingHint {
    Close,
    KeepOpen,
}

/// Splits a test case identity into its numeric id (when the name minus the
/// closing suffix is all ascii digits) and its closing hint.
fn parse_identity(name: &str) -> (Option<u64>, ClosingHint) {
    let (stem, closing) = match name.strip_suffix(KEEP_OPEN_SUFFIX) {
        Some(stem) => (stem, ClosingHint::KeepOpen),
        None => (name, ClosingHint::Close),
    };

    let number = if !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit()) {
        stem.parse::<u64>().ok()
    } else {
        None
    };

    (number, closing)
}

/// `TestCase` is one opaque payload. Nothing about the bytes is ever
/// inspected; cloning only bumps a reference count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    name: String,
    number: Option<u64>,
    closing: ClosingHint,
    payload: Bytes,
}

impl TestCase {
    pub fn new(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        let name = name.into();
        let (number, closing) = parse_identity(&name);
        Self {
            name,
            number,
            closing,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn number(&self) -> Option<u64> {
        self.number
    }

    #[must_use]
    pub fn closing(&self) -> ClosingHint {
        self.closing
    }

    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    // numeric ids first in ascending order, then plain byte order of names
    fn order_key(&self) -> (bool, u64, &[u8]) {
        (
            self.number.is_none(),
            self.number.unwrap_or_default(),
            self.name.as_bytes(),
        )
    }
}

// -- Selection

/// Inclusive range of numeric ids to load. An unrestricted selection admits
/// every entry, a restricted one only numerically named entries in range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Selection {
    pub start: Option<u64>,
    pub stop: Option<u64>,
}

impl Selection {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn range(start: u64, stop: u64) -> Self {
        Self {
            start: Some(start),
            stop: Some(stop),
        }
    }

    #[must_use]
    pub fn single(number: u64) -> Self {
        Self::range(number, number)
    }

    #[must_use]
    pub fn is_restricted(&self) -> bool {
        self.start.is_some() || self.stop.is_some()
    }

    #[must_use]
    pub fn admits(&self, name: &str) -> bool {
        if !self.is_restricted() {
            return true;
        }

        match parse_identity(name).0 {
            Some(number) => {
                number >= self.start.unwrap_or(u64::MIN) && number <= self.stop.unwrap_or(u64::MAX)
            }
            None => false,
        }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.start, self.stop) {
            (None, None) => write!(f, "all"),
            (start, stop) => write!(
                f,
                "{}-{}",
                start.unwrap_or(u64::MIN),
                stop.map_or_else(|| String::from("max"), |stop| stop.to_string())
            ),
        }
    }
}

// -- Sources

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestCaseSource {
    Directory(PathBuf),
    Archive(PathBuf),
    File(PathBuf),
}

impl TestCaseSource {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Directory(path) | Self::Archive(path) | Self::File(path) => path,
        }
    }
}

impl fmt::Display for TestCaseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory(path) => write!(f, "directory {}", path.display()),
            Self::Archive(path) => write!(f, "zip file {}", path.display()),
            Self::File(path) => write!(f, "file {}", path.display()),
        }
    }
}

// -- Store

/// `TestCaseStore` is the ordered, immutable set of test cases served for
/// the whole process lifetime. It is never empty and identities are unique.
#[derive(Debug, Clone)]
pub struct TestCaseStore {
    origin: String,
    cases: Vec<TestCase>,
}

// -- Constructors

impl TestCaseStore {
    /// Orders `cases` and checks the store invariants.
    pub fn from_cases(
        origin: impl Into<String>,
        mut cases: Vec<TestCase>,
    ) -> Result<Self, LoadError> {
        let origin = origin.into();
        if cases.is_empty() {
            return Err(LoadError::EmptyTestSet(origin));
        }

        cases.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

        if let Some(pair) = cases.windows(2).find(|pair| pair[0].name == pair[1].name) {
            return Err(LoadError::DuplicateTestCase(pair[0].name.clone()));
        }

        Ok(Self { origin, cases })
    }

    /// Loads every admitted entry of `source`. The first unreadable entry
    /// aborts the whole load.
    pub fn load(source: &TestCaseSource, selection: Selection) -> Result<Self, LoadError> {
        let path = source.path();
        if !path.exists() {
            return Err(LoadError::SourceNotFound(path.to_path_buf()));
        }

        let cases = match source {
            TestCaseSource::Directory(path) => read_directory(path, selection)?,
            TestCaseSource::Archive(path) => read_archive(path, selection)?,
            TestCaseSource::File(path) => read_single_file(path)?,
        };

        let origin = if selection.is_restricted() {
            format!("{source} in range {selection}")
        } else {
            source.to_string()
        };

        Self::from_cases(origin, cases)
    }

    /// Loads the source a [`SourceConfig`] points at. An automatically
    /// discovered archive that is unusable gives way to the directory.
    pub fn load_configured(config: &SourceConfig, selection: Selection) -> Result<Self, LoadError> {
        match config.plan() {
            SourcePlan::Exact(source) => Self::load(&source, selection),
            SourcePlan::PreferArchive { archive, directory } => {
                reply_trace::info!(
                    "Found zip file {}, using it instead of directory",
                    archive.display()
                );

                match Self::load(&TestCaseSource::Archive(archive), selection) {
                    Err(err @ (LoadError::InvalidArchive { .. } | LoadError::EmptyTestSet(_))) => {
                        reply_trace::warn!("{}, falling back to directory", err);
                        Self::load(&TestCaseSource::Directory(directory), selection)
                    }
                    loaded => loaded,
                }
            }
        }
    }
}

// -- Accessors

impl TestCaseStore {
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    #[must_use]
    pub fn get(&self, position: usize) -> Option<&TestCase> {
        self.cases.get(position)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TestCase> {
        self.cases.iter()
    }

    #[must_use]
    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.cases.iter().position(|case| case.name == name)
    }
}

impl<'a> IntoIterator for &'a TestCaseStore {
    type Item = &'a TestCase;
    type IntoIter = std::slice::Iter<'a, TestCase>;

    fn into_iter(self) -> Self::IntoIter {
        self.cases.iter()
    }
}

// -- Readers

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn read_directory(path: &Path, selection: Selection) -> Result<Vec<TestCase>, LoadError> {
    let entries =
        fs::read_dir(path).map_err(|err| read_failure(path.display().to_string(), err))?;

    let mut cases = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| read_failure(path.display().to_string(), err))?;
        let entry_path = entry.path();

        let metadata = fs::metadata(&entry_path)
            .map_err(|err| read_failure(entry_path.display().to_string(), err))?;
        if !metadata.is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        if is_hidden(&name) || !selection.admits(&name) {
            continue;
        }

        let payload = fs::read(&entry_path)
            .map_err(|err| read_failure(entry_path.display().to_string(), err))?;
        cases.push(TestCase::new(name, payload));
    }

    Ok(cases)
}

fn read_archive(path: &Path, selection: Selection) -> Result<Vec<TestCase>, LoadError> {
    let archive_failure = |err: zip::result::ZipError| match err {
        zip::result::ZipError::Io(source) => read_failure(path.display().to_string(), source),
        other => LoadError::InvalidArchive {
            path: path.to_path_buf(),
            reason: other.to_string(),
        },
    };

    let file = fs::File::open(path).map_err(|err| read_failure(path.display().to_string(), err))?;
    let mut archive = zip::ZipArchive::new(file).map_err(archive_failure)?;

    let mut cases = Vec::new();
    for position in 0..archive.len() {
        let mut entry = archive.by_index(position).map_err(archive_failure)?;
        if entry.is_dir() {
            continue;
        }

        let entry_name = entry.name().to_owned();
        let Some(base_name) = entry_name.rsplit('/').next().filter(|name| !name.is_empty())
        else {
            continue;
        };

        if is_hidden(base_name) || !selection.admits(base_name) {
            continue;
        }

        let mut payload = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or_default());
        entry.read_to_end(&mut payload).map_err(|err| {
            read_failure(format!("{}:{}", path.display(), entry_name), err)
        })?;

        cases.push(TestCase::new(base_name, payload));
    }

    Ok(cases)
}

fn read_single_file(path: &Path) -> Result<Vec<TestCase>, LoadError> {
    let payload = fs::read(path).map_err(|err| read_failure(path.display().to_string(), err))?;
    let name = path.file_name().map_or_else(
        || path.display().to_string(),
        |name| name.to_string_lossy().into_owned(),
    );

    Ok(vec![TestCase::new(name, payload)])
}
