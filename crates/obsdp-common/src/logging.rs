//! Tracing setup for OBSDP binaries
//!
//! Events always go to stdout. Setting `LOG_DIR` adds a daily file under that
//! directory, written through a non-blocking appender.
//!
//! ```no_run
//! use obsdp_common::logging::{init_logging, LogConfig};
//!
//! let config = LogConfig::builder()
//!     .log_file_prefix("obsdp-server")
//!     .build()
//!     .merge_env()
//!     .expect("LOG_* variables");
//! let _guard = init_logging(&config).expect("logging");
//! tracing::info!(source_id = 4, "Harvest committed");
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Floor applied before any directive
    pub level: Level,
    /// Daily files are written here when set
    pub log_dir: Option<PathBuf>,
    /// "obsdp-server" gives files named "obsdp-server.2026-10-17"
    pub log_file_prefix: String,
    /// Comma separated, e.g. "sqlx=warn,obsdp_server=debug"
    pub filter_directives: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            log_dir: None,
            log_file_prefix: "obsdp".to_string(),
            filter_directives: None,
        }
    }
}

impl LogConfig {
    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    /// Apply `LOG_LEVEL`, `LOG_DIR`, `LOG_FILE_PREFIX` and `LOG_FILTER` on top of `self`
    pub fn merge_env(mut self) -> Result<Self> {
        if let Some(level) = env_value("LOG_LEVEL") {
            self.level = level
                .parse()
                .with_context(|| format!("LOG_LEVEL has an invalid value '{level}'"))?;
        }
        if let Some(dir) = env_value("LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(prefix) = env_value("LOG_FILE_PREFIX") {
            self.log_file_prefix = prefix;
        }
        if let Some(filter) = env_value("LOG_FILTER") {
            self.filter_directives = Some(filter);
        }
        Ok(self)
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::from_default_env().add_directive(self.level.into());
        for directive in self
            .filter_directives
            .iter()
            .flat_map(|d| d.split(','))
            .map(str::trim)
            .filter(|d| !d.is_empty())
        {
            filter = filter.add_directive(
                directive
                    .parse()
                    .with_context(|| format!("Bad log directive '{directive}'"))?,
            );
        }
        Ok(filter)
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    pub fn filter_directives(mut self, filter: impl Into<String>) -> Self {
        self.config.filter_directives = Some(filter.into());
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

/// Install the global subscriber. Hold the returned guard until exit so the
/// file writer flushes.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let console = fmt::layer().with_writer(std::io::stdout);

    let (file, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, &config.log_file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .with(config.env_filter()?)
        .try_init()
        .context("Tracing subscriber already installed")?;

    Ok(guard)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_keeps_console_only_default() {
        let config = LogConfig::builder()
            .log_file_prefix("obsdp-server")
            .filter_directives("obsdp_server=debug")
            .build();

        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.log_dir, None);
        assert_eq!(config.log_file_prefix, "obsdp-server");
        assert!(config.env_filter().is_ok());
    }

    #[test]
    fn test_bad_directive_is_reported() {
        let config = LogConfig::builder()
            .filter_directives("obsdp_server=debug,sqlx=loudest")
            .build();
        let err = config.env_filter().unwrap_err();
        assert!(err.to_string().contains("sqlx=loudest"));
    }

    #[test]
    fn test_blank_directives_are_skipped() {
        let config = LogConfig::builder().filter_directives(" , ,").build();
        assert!(config.env_filter().is_ok());
    }
}
