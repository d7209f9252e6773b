//! Logging setup for processes running jobwright engines
//!
//! Installs a `tracing-subscriber` fmt subscriber. The filter comes from
//! `JOBWRIGHT_LOG` (same syntax as `RUST_LOG`, default `info`) and the format
//! from `JOBWRIGHT_LOG_FORMAT` (`json`, `compact`, `pretty` or `plain`).
//!
//! ```no_run
//! #[tokio::main]
//! async fn main() {
//!     let _guard = jobwright::logging::init();
//!     tracing::info!("Worker process started");
//! }
//! ```

use std::io;
use std::str::FromStr;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

/// Filter variable
pub const LOG_ENV: &str = "JOBWRIGHT_LOG";

/// Format variable
pub const LOG_FORMAT_ENV: &str = "JOBWRIGHT_LOG_FORMAT";

const DEFAULT_FILTER: &str = "info";

/// Output format for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event
    Json,
    /// Single-line human readable output
    #[default]
    Compact,
    /// Multi-line human readable output
    Pretty,
    /// Default fmt output
    Plain,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "plain" | "full" => Ok(Self::Plain),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// Where log events are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    /// Standard output
    #[default]
    Stdout,
    /// Standard error
    Stderr,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    filter: String,
    format: LogFormat,
    output: LogOutput,
    targets: bool,
    colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            targets: true,
            colors: true,
        }
    }
}

impl LogConfig {
    /// Default configuration: compact output to stdout at `info`
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration from `JOBWRIGHT_LOG` and `JOBWRIGHT_LOG_FORMAT`
    pub fn from_env() -> Self {
        Self::from_vars(std::env::var(LOG_ENV).ok(), std::env::var(LOG_FORMAT_ENV).ok())
    }

    fn from_vars(filter: Option<String>, format: Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(filter) = filter.filter(|f| !f.trim().is_empty()) {
            config.filter = filter;
        }
        if let Some(format) = format {
            match format.parse() {
                Ok(format) => config.format = format,
                Err(e) => eprintln!("jobwright: {}, using compact", e),
            }
        }
        config
    }

    /// Set the filter directive (e.g. `jobwright_queue=debug,info`)
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Set the output format
    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the output stream
    pub fn output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    /// Include event targets
    pub fn with_targets(mut self, targets: bool) -> Self {
        self.targets = targets;
        self
    }

    /// Use ANSI colors (ignored for JSON)
    pub fn with_colors(mut self, colors: bool) -> Self {
        self.colors = colors;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }

    /// Install the global subscriber.
    ///
    /// Keep the returned guard alive; dropping it flushes buffered events.
    /// Fails if a global subscriber is already installed.
    pub fn try_init(self) -> Result<WorkerGuard, TryInitError> {
        let (writer, guard) = match self.output {
            LogOutput::Stdout => tracing_appender::non_blocking(io::stdout()),
            LogOutput::Stderr => tracing_appender::non_blocking(io::stderr()),
        };
        let filter = self.env_filter();

        match self.format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_target(self.targets),
                )
                .try_init()?,
            LogFormat::Compact => tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .compact()
                        .with_writer(writer)
                        .with_target(self.targets)
                        .with_ansi(self.colors),
                )
                .try_init()?,
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .pretty()
                        .with_writer(writer)
                        .with_target(self.targets)
                        .with_ansi(self.colors),
                )
                .try_init()?,
            LogFormat::Plain => tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(writer)
                        .with_target(self.targets)
                        .with_ansi(self.colors),
                )
                .try_init()?,
        }

        Ok(guard)
    }
}

/// Install the global subscriber configured from the environment.
///
/// Returns `None` if a subscriber was already installed.
pub fn init() -> Option<WorkerGuard> {
    LogConfig::from_env().try_init().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" Pretty ".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Plain);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_config_from_vars() {
        let config = LogConfig::from_vars(
            Some("jobwright_queue=debug".to_string()),
            Some("json".to_string()),
        );
        assert_eq!(config.filter, "jobwright_queue=debug");
        assert_eq!(config.format, LogFormat::Json);

        let fallback = LogConfig::from_vars(Some("  ".to_string()), Some("yaml".to_string()));
        assert_eq!(fallback, LogConfig::default());
    }

    #[test]
    fn test_init_twice_fails() {
        let _guard = LogConfig::new().filter("warn").try_init().unwrap();
        assert!(LogConfig::new().try_init().is_err());
    }
}
