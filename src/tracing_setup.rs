//! Tracing subscriber setup.
//!
//! Builds a `tracing-subscriber` registry with an `EnvFilter` and one `fmt`
//! layer in the requested [`OutputFormat`]. `RUST_LOG` always wins over the
//! configured level.
//!
//! ```no_run
//! use pm100x_panel::tracing_setup::{self, TracingConfig};
//!
//! tracing_setup::init(TracingConfig::from_verbosity(true))?;
//! tracing::info!("Looking for devices...");
//! # Ok::<(), String>(())
//! ```

use crate::config::PanelConfig;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, coloured (development)
    Pretty,
    /// One line per event
    Compact,
    /// JSON lines, for log collection
    Json,
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Used when `RUST_LOG` is unset
    pub level: Level,
    /// Event layout
    pub format: OutputFormat,
    /// Emit span NEW/CLOSE events
    pub with_span_events: bool,
    /// Source location on every event
    pub with_file_and_line: bool,
    /// ANSI colours (ignored for JSON)
    pub with_ansi: bool,
    /// Print the event target (module path)
    pub with_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_ansi: true,
            with_target: false,
        }
    }
}

impl TracingConfig {
    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Level from the configuration file.
    pub fn from_config(config: &PanelConfig) -> Result<Self, String> {
        Ok(Self::new(parse_log_level(&config.application.log_level)?))
    }

    /// INFO when verbose, ERROR when quiet (`-s`).
    pub fn from_verbosity(verbose: bool) -> Self {
        Self::new(verbosity_level(verbose))
    }

    /// Set the output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Log span creation and close.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable ANSI colours.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    /// Print event targets.
    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }
}

/// Level for the verbosity switch.
pub fn verbosity_level(verbose: bool) -> Level {
    if verbose {
        Level::INFO
    } else {
        Level::ERROR
    }
}

/// Initialise tracing from the configuration file's log level.
pub fn init_from_config(config: &PanelConfig) -> Result<(), String> {
    init(TracingConfig::from_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a subscriber is already installed (tests, embedding
/// applications) this returns `Ok(())`.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_target(config.with_target);

    let layer = match config.format {
        OutputFormat::Pretty => base.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Json => base.json().with_ansi(false).boxed(),
    };

    let result = tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init();
    already_initialized_is_ok(result)
}

fn already_initialized_is_ok(result: Result<(), TryInitError>) -> Result<(), String> {
    match result {
        Ok(()) => Ok(()),
        // Either the dispatcher or the `log` bridge was installed before
        Err(e) if e.to_string().contains("already") => Ok(()),
        Err(e) => Err(format!("Failed to initialize tracing: {e}")),
    }
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace"), Ok(Level::TRACE));
        assert_eq!(parse_log_level("Debug"), Ok(Level::DEBUG));
        assert_eq!(parse_log_level("INFO"), Ok(Level::INFO));
        assert_eq!(parse_log_level("warn"), Ok(Level::WARN));
        assert_eq!(parse_log_level("error"), Ok(Level::ERROR));
        assert!(parse_log_level("critical").is_err());
    }

    #[test]
    fn test_verbosity() {
        assert_eq!(TracingConfig::from_verbosity(true).level, Level::INFO);
        assert_eq!(TracingConfig::from_verbosity(false).level, Level::ERROR);
    }

    #[test]
    fn test_from_config() {
        let mut config = PanelConfig::default();
        config.application.log_level = "warn".into();
        assert_eq!(TracingConfig::from_config(&config).map(|c| c.level), Ok(Level::WARN));

        config.application.log_level = "nope".into();
        assert!(TracingConfig::from_config(&config).is_err());
    }

    #[test]
    fn test_builder() {
        let config = TracingConfig::new(Level::DEBUG)
            .with_format(OutputFormat::Json)
            .with_span_events(true)
            .with_ansi(false)
            .with_target(true);

        assert_eq!(config.format, OutputFormat::Json);
        assert!(config.with_span_events);
        assert!(!config.with_ansi);
        assert!(config.with_target);
    }
}
