use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use http_reply::{
    config::{self, ConfigResult, ReplayConfig},
    DispatchTrigger, SequenceMode,
};
use reply_trace::Level;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Serve every test case once, then stop.
    SinglePass,
    /// Start over after the last test case.
    Loop,
}

impl From<ModeArg> for SequenceMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::SinglePass => Self::SinglePass,
            ModeArg::Loop => Self::Loop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TriggerArg {
    /// One test case per connection.
    PerConnection,
    /// Keep-open test cases are followed by the next case on the next request.
    PerRequest,
}

impl From<TriggerArg> for DispatchTrigger {
    fn from(value: TriggerArg) -> Self {
        match value {
            TriggerArg::PerConnection => Self::PerConnection,
            TriggerArg::PerRequest => Self::PerRequest,
        }
    }
}

/// Replays raw test case files verbatim to HTTP clients under test.
///
/// Flags override values read from the config file.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// TOML config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory holding one test case per file
    #[arg(short = 'd', long)]
    pub testdir: Option<PathBuf>,

    /// Zip archive holding one test case per entry
    #[arg(short, long)]
    pub zip: Option<PathBuf>,

    /// Serve this single file as the only test case
    #[arg(short, long, conflicts_with_all = ["zip", "testdir"])]
    pub file: Option<PathBuf>,

    /// Only serve the test case with this number
    #[arg(short, long, conflicts_with_all = ["start", "stop"])]
    pub single: Option<u64>,

    /// First test case number to serve
    #[arg(long)]
    pub start: Option<u64>,

    /// Last test case number to serve
    #[arg(long)]
    pub stop: Option<u64>,

    #[arg(short, long, value_enum)]
    pub mode: Option<ModeArg>,

    #[arg(short, long, value_enum)]
    pub trigger: Option<TriggerArg>,

    /// How long to wait for a request before dispatching anyway
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Delay between the last byte sent and closing the connection
    #[arg(long)]
    pub close_delay_ms: Option<u64>,

    /// Append log lines to this file as well as stdout
    #[arg(short, long)]
    pub log_file: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    #[must_use]
    pub fn level(&self) -> Level {
        if self.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        }
    }

    /// Reads the config file, if any, and lays the flags over it.
    pub fn resolve(&self) -> ConfigResult<ReplayConfig> {
        let mut replay = match &self.config {
            Some(path) => config::from_path(path)?,
            None => ReplayConfig::default(),
        };
        self.apply(&mut replay);
        Ok(replay)
    }

    fn apply(&self, replay: &mut ReplayConfig) {
        if let Some(host) = &self.host {
            replay.listen.host.clone_from(host);
        }
        if let Some(port) = self.port {
            replay.listen.port = port;
        }

        if let Some(directory) = &self.testdir {
            replay.source.directory.clone_from(directory);
        }
        if self.zip.is_some() {
            replay.source.archive.clone_from(&self.zip);
        }
        if self.file.is_some() {
            replay.source.file.clone_from(&self.file);
        }

        if self.single.is_some() {
            replay.selection.single = self.single;
        }
        if self.start.is_some() || self.stop.is_some() {
            replay.selection.single = None;
            replay.selection.start = self.start.or(replay.selection.start);
            replay.selection.stop = self.stop.or(replay.selection.stop);
        }

        if let Some(mode) = self.mode {
            replay.dispatch.mode = mode.into();
        }
        if let Some(trigger) = self.trigger {
            replay.dispatch.trigger = trigger.into();
        }
        if let Some(timeout) = self.read_timeout_ms {
            replay.dispatch.read_timeout_ms = timeout;
        }
        if let Some(delay) = self.close_delay_ms {
            replay.dispatch.close_delay_ms = delay;
        }

        if self.log_file.is_some() {
            replay.log_file.clone_from(&self.log_file);
        }
    }
}
