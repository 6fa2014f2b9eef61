//! Logger construction for processes embedding the partition consumer.
//!
//! The consumer itself never builds a [`Logger`] on its own -- it is handed one through
//! [`crate::context::Context`] -- but a binary wiring the consumer together needs a
//! starting point. This mirrors the shape of the legacy `replicante::logging` module,
//! modernised to build a [`Logger`] directly instead of through `error-chain`.
use std::io::stdout;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use slog::Drain;
use slog::IgnoreResult;
use slog::Logger;
use slog::Never;
use slog::OwnedKVList;
use slog::Record;
use slog::SendSyncRefUnwindSafeDrain;
use slog::SendSyncUnwindSafeDrain;
use slog_async::Async;
use slog_json::Json;

/// Possible logging levels exposed to configuration files.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum LoggingLevel {
    #[serde(rename = "critical")]
    Critical,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "warning")]
    Warning,
    #[serde(rename = "info")]
    Info,
    #[serde(rename = "debug")]
    Debug,
}

impl Default for LoggingLevel {
    fn default() -> LoggingLevel {
        LoggingLevel::Info
    }
}

impl From<LoggingLevel> for slog::Level {
    fn from(level: LoggingLevel) -> Self {
        match level {
            LoggingLevel::Critical => slog::Level::Critical,
            LoggingLevel::Error => slog::Level::Error,
            LoggingLevel::Warning => slog::Level::Warning,
            LoggingLevel::Info => slog::Level::Info,
            LoggingLevel::Debug => slog::Level::Debug,
        }
    }
}

/// Logging configuration for a process that hosts the partition consumer.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Flush logs asynchronously.
    #[serde(default = "Config::default_async")]
    pub asynchronous: bool,

    /// The minimum logging level.
    #[serde(default)]
    pub level: LoggingLevel,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            asynchronous: Config::default_async(),
            level: LoggingLevel::default(),
        }
    }
}

impl Config {
    fn default_async() -> bool {
        true
    }
}

/// Alternative implementation of slog's `LevelFilter` with `Ok == ()`.
///
/// The default `LevelFilter` wraps `D::Ok` into an [`Option`], which makes it
/// impossible to wrap a filtering drain into a [`Logger`] directly.
#[derive(Debug, Clone)]
struct LevelFilter<D: Drain>(D, slog::Level);

impl<D: Drain> Drain for LevelFilter<D> {
    type Ok = ();
    type Err = D::Err;
    fn log(&self, record: &Record, logger_values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.1) {
            self.0.log(record, logger_values)?;
        }
        Ok(())
    }
}

fn into_logger<D>(drain: D) -> Logger
where
    D: SendSyncUnwindSafeDrain<Ok = (), Err = Never>,
    D: 'static + SendSyncRefUnwindSafeDrain<Ok = (), Err = Never>,
{
    Logger::root(drain, slog::o!("component" => "partition-consumer"))
}

fn config_async<D>(config: &Config, drain: D) -> Logger
where
    D: SendSyncUnwindSafeDrain<Ok = (), Err = Never>,
    D: 'static + SendSyncRefUnwindSafeDrain<Ok = (), Err = Never>,
{
    if config.asynchronous {
        into_logger(Async::new(drain).build().ignore_res())
    } else {
        into_logger(drain)
    }
}

/// Build a [`Logger`] that writes newline-delimited JSON to stdout.
pub fn configure(config: Config) -> Logger {
    let level = config.level.into();
    let drain = Mutex::new(Json::default(stdout())).map(IgnoreResult::new);
    let drain = LevelFilter(drain, level);
    config_async(&config, drain)
}

/// A fixed [`Logger`] to use before configuration is loaded.
pub fn starter() -> Logger {
    let drain = Mutex::new(Json::default(stdout())).map(IgnoreResult::new);
    into_logger(drain)
}
