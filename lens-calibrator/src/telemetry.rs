//! Logging configuration and initialization.
//!
//! Library code logs through the `log` facade; the binary installs an
//! `env_logger` backend through [`init_logging`].

use env_logger::{Builder, Env, WriteStyle};

/// Environment variable checked before `RUST_LOG`.
pub const LOG_ENV_VAR: &str = "LENS_CALIBRATOR_LOG";

/// Environment variable controlling colored output.
pub const LOG_STYLE_ENV_VAR: &str = "LENS_CALIBRATOR_LOG_STYLE";

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level filter (default: "info")
    pub default_level: String,
    /// Include millisecond timestamps (default: true)
    pub timestamps_millis: bool,
    /// Colored output (default: auto)
    pub write_style: WriteStyle,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            timestamps_millis: true,
            write_style: WriteStyle::Auto,
        }
    }
}

impl LogConfig {
    /// Config that raises the default filter to `debug`.
    pub fn verbose() -> Self {
        Self {
            default_level: "debug".to_string(),
            ..Self::default()
        }
    }
}

/// Resolve the filter string: `LENS_CALIBRATOR_LOG`, then `RUST_LOG`, then the config default.
pub fn resolve_filter(config: &LogConfig) -> String {
    std::env::var(LOG_ENV_VAR)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| config.default_level.clone())
}

/// Initialize the global logger.
///
/// Returns an error if a logger was already installed.
///
/// # Environment Variables
///
/// - `LENS_CALIBRATOR_LOG`: log level filter (e.g., "debug", "info,lens_calibrator::distributor=debug")
/// - `LENS_CALIBRATOR_LOG_STYLE`: "always", "never" or "auto"
pub fn init_logging(config: &LogConfig) -> Result<(), log::SetLoggerError> {
    let env = Env::default().write_style(LOG_STYLE_ENV_VAR);
    let mut builder = Builder::from_env(env);
    builder.parse_filters(&resolve_filter(config));
    if std::env::var(LOG_STYLE_ENV_VAR).is_err() {
        builder.write_style(config.write_style);
    }

    if config.timestamps_millis {
        builder.format_timestamp_millis();
    }

    builder.try_init()?;

    log::info!(
        "Logging initialized (lens-calibrator {})",
        env!("CARGO_PKG_VERSION")
    );

    Ok(())
}
