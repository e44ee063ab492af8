//! Command line of the `piggyback-hub` daemon.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::level_filters::LevelFilter;

#[derive(Debug, Parser)]
#[command(name = "piggyback-hub", version, about = "Relays piggyback data between Checkmk sites")]
pub struct Args {
    /// PID file, locked for as long as the hub runs.
    pub pid_file: PathBuf,

    /// Log file (appended to).
    pub log_file: PathBuf,

    /// Site root directory.
    pub omd_root: PathBuf,

    /// Site name.
    pub omd_site: String,

    /// Stay in the foreground instead of daemonizing.
    #[arg(short = 'g', long)]
    pub foreground: bool,

    /// Return errors from main instead of logging and crash-reporting them.
    #[arg(long)]
    pub debug: bool,

    /// Log level, unless overridden by RUST_LOG.
    #[arg(short = 'v', long = "log-level", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}
