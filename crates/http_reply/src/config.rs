use std::{path::PathBuf, time::Duration};

use derive_more::derive::From;
use serde::{de::DeserializeOwned, Deserialize};

use crate::{
    sequencer::{DispatchTrigger, SequenceMode},
    server::ServerSettings,
    store::{Selection, TestCaseSource},
};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BACKLOG: u32 = 128;
pub const DEFAULT_TEST_DIRECTORY: &str = "testcases";
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 64 * 1024;

// -- Errors

#[derive(Debug, From)]
pub enum ConfigError {
    Unreadable(std::io::Error),
    Malformed(toml::de::Error),
    #[from(ignore)]
    NotAFile(PathBuf),
}

impl std::error::Error for ConfigError {}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreadable(err) => write!(f, "unable to read configuration: {err}"),
            Self::Malformed(err) => write!(f, "invalid configuration: {err}"),
            Self::NotAFile(path) => {
                write!(f, "configuration file {} does not exist", path.display())
            }
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Reads and deserializes a TOML document from `target`.
pub fn from_path<T, V>(target: V) -> ConfigResult<T>
where
    T: DeserializeOwned,
    V: Into<PathBuf>,
{
    let target_path = target.into();
    if !target_path.is_file() {
        return Err(ConfigError::NotAFile(target_path));
    }

    let config_content = std::fs::read_to_string(target_path)?;
    from_str(&config_content)
}

pub fn from_str<T: DeserializeOwned>(content: &str) -> ConfigResult<T> {
    let config_obj: T = toml::from_str(content)?;
    Ok(config_obj)
}

// -- Sections

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: String::from(DEFAULT_HOST),
            port: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub directory: PathBuf,
    pub archive: Option<PathBuf>,
    pub file: Option<PathBuf>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(DEFAULT_TEST_DIRECTORY),
            archive: None,
            file: None,
        }
    }
}

/// How a [`SourceConfig`] turns into something loadable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcePlan {
    Exact(TestCaseSource),
    PreferArchive { archive: PathBuf, directory: PathBuf },
}

impl SourceConfig {
    /// `<directory>.zip`, the archive looked for when none was named.
    #[must_use]
    pub fn default_archive(&self) -> Option<PathBuf> {
        let name = self.directory.file_name()?;
        let mut archive_name = name.to_os_string();
        archive_name.push(".zip");
        Some(self.directory.with_file_name(archive_name))
    }

    /// Lookup order: single file, named archive, `<directory>.zip`, directory.
    #[must_use]
    pub fn plan(&self) -> SourcePlan {
        if let Some(file) = &self.file {
            return SourcePlan::Exact(TestCaseSource::File(file.clone()));
        }

        if let Some(archive) = &self.archive {
            return SourcePlan::Exact(TestCaseSource::Archive(archive.clone()));
        }

        match self.default_archive() {
            Some(archive) if archive.is_file() => SourcePlan::PreferArchive {
                archive,
                directory: self.directory.clone(),
            },
            _ => SourcePlan::Exact(TestCaseSource::Directory(self.directory.clone())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SelectionConfig {
    pub start: Option<u64>,
    pub stop: Option<u64>,
    pub single: Option<u64>,
}

impl SelectionConfig {
    #[must_use]
    pub fn selection(&self) -> Selection {
        match self.single {
            Some(number) => Selection::single(number),
            None => Selection {
                start: self.start,
                stop: self.stop,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub mode: SequenceMode,
    pub trigger: DispatchTrigger,
    pub read_timeout_ms: u64,
    pub close_delay_ms: u64,
    pub max_request_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: SequenceMode::default(),
            trigger: DispatchTrigger::default(),
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            close_delay_ms: 0,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

/// `ReplayConfig` is the complete typed configuration of a replay server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplayConfig {
    pub listen: ListenConfig,
    pub source: SourceConfig,
    pub selection: SelectionConfig,
    pub dispatch: DispatchConfig,
    pub log_file: Option<PathBuf>,
}

impl ReplayConfig {
    #[must_use]
    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            host: self.listen.host.clone(),
            port: self.listen.port,
            backlog: self.listen.backlog,
            read_timeout: Duration::from_millis(self.dispatch.read_timeout_ms),
            close_delay: Duration::from_millis(self.dispatch.close_delay_ms),
            trigger: self.dispatch.trigger,
            max_request_bytes: self.dispatch.max_request_bytes,
        }
    }
}
