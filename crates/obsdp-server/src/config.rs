//! Configuration management

use obsdp_common::ObsdpError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::pipeline::selection::SourceSelection;
use crate::reports::validation::SampleGuard;
use crate::scheduler::jobs::RecurringSchedules;
use crate::scheduler::{CronSpec, Timezone};

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Default wait after an archive upload before it is harvested, in seconds.
pub const DEFAULT_ARCHIVE_SETTLE_SECS: u64 = 5;

/// Default number of sources a process run reads concurrently.
pub const DEFAULT_PROCESS_READ_CONCURRENCY: usize = 4;

/// Default directory for uploaded archives.
pub const DEFAULT_UPLOAD_DIR: &str = "./data/uploads";

/// Default directory for validation reports.
pub const DEFAULT_REPORT_DIR: &str = "./data/reports";

/// Default age in days after which validation reports are removed.
pub const DEFAULT_REPORT_TTL_DAYS: u32 = 30;

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Schedule Constants
// ============================================================================

pub const DEFAULT_SCHEDULE_TIMEZONE: &str = "UTC";

pub const DEFAULT_HARVEST_CRON: &str = "0 1 * * *";

pub const DEFAULT_PROCESS_CRON: &str = "0 4 * * *";

pub const DEFAULT_CLEANUP_CRON: &str = "30 2 * * *";

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub reports: ReportConfig,
    pub database: Option<DatabaseConfig>,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub upload_dir: PathBuf,
    pub archive_settle_secs: u64,
    /// Comma separated source identifiers, one per mask bit; registry order when unset
    pub selection_layout: Option<String>,
    pub read_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    pub dir: PathBuf,
    pub ttl_days: u32,
    pub sample_guard: SampleGuard,
}

/// Slot state persistence; in-memory when absent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Recurring jobs; an empty cron disables the job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub timezone: String,
    pub harvest_cron: Option<String>,
    pub process_cron: Option<String>,
    pub cleanup_cron: Option<String>,
    /// Sources of the recurring process run; every active source when unset
    pub process_mask: Option<u64>,
    pub process_clean_start: bool,
    pub process_promote: bool,
}

/// Parse `key` if it is set; a set but malformed value is an error, never a default
fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ObsdpError> {
    let raw = match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw,
        _ => return Ok(None),
    };
    raw.trim().parse().map(Some).map_err(|_| {
        ObsdpError::invalid_argument(format!("{key} has an invalid value '{}'", raw.trim()))
    })
}

fn env_cron(key: &str, default: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => None,
        Ok(value) => Some(value.trim().to_string()),
        Err(_) => Some(default.to_string()),
    }
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let sample_guard = match std::env::var("OBSDP_REPORT_SAMPLE_GUARD") {
            Ok(raw) => raw.parse()?,
            Err(_) => SampleGuard::default(),
        };

        let config = Config {
            pipeline: PipelineConfig {
                upload_dir: std::env::var("OBSDP_UPLOAD_DIR")
                    .unwrap_or_else(|_| DEFAULT_UPLOAD_DIR.to_string())
                    .into(),
                archive_settle_secs: env_parse("OBSDP_ARCHIVE_SETTLE_SECS")?
                    .unwrap_or(DEFAULT_ARCHIVE_SETTLE_SECS),
                selection_layout: std::env::var("OBSDP_SELECTION_LAYOUT")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
                read_concurrency: env_parse("OBSDP_PROCESS_READ_CONCURRENCY")?
                    .unwrap_or(DEFAULT_PROCESS_READ_CONCURRENCY),
            },
            reports: ReportConfig {
                dir: std::env::var("OBSDP_REPORT_DIR")
                    .unwrap_or_else(|_| DEFAULT_REPORT_DIR.to_string())
                    .into(),
                ttl_days: env_parse("OBSDP_REPORT_TTL_DAYS")?.unwrap_or(DEFAULT_REPORT_TTL_DAYS),
                sample_guard,
            },
            database: std::env::var("DATABASE_URL")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(|url| -> Result<DatabaseConfig, ObsdpError> {
                    Ok(DatabaseConfig {
                        url,
                        max_connections: env_parse("DATABASE_MAX_CONNECTIONS")?
                            .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
                        connect_timeout_secs: env_parse("DATABASE_CONNECT_TIMEOUT")?
                            .unwrap_or(DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS),
                    })
                })
                .transpose()?,
            schedule: ScheduleConfig {
                timezone: std::env::var("OBSDP_SCHEDULE_TIMEZONE")
                    .unwrap_or_else(|_| DEFAULT_SCHEDULE_TIMEZONE.to_string()),
                harvest_cron: env_cron("OBSDP_HARVEST_CRON", DEFAULT_HARVEST_CRON),
                process_cron: env_cron("OBSDP_PROCESS_CRON", DEFAULT_PROCESS_CRON),
                cleanup_cron: env_cron("OBSDP_REPORT_CLEANUP_CRON", DEFAULT_CLEANUP_CRON),
                process_mask: env_parse("OBSDP_PROCESS_MASK")?,
                process_clean_start: env_parse("OBSDP_PROCESS_CLEAN_START")?.unwrap_or(true),
                process_promote: env_parse("OBSDP_PROCESS_PROMOTE")?.unwrap_or(true),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pipeline.read_concurrency == 0 {
            anyhow::bail!("OBSDP_PROCESS_READ_CONCURRENCY must be greater than 0");
        }

        if self.reports.ttl_days == 0 {
            anyhow::bail!("OBSDP_REPORT_TTL_DAYS must be greater than 0");
        }

        if self.pipeline.upload_dir == self.reports.dir {
            anyhow::bail!(
                "Upload and report directories must differ ({})",
                self.reports.dir.display()
            );
        }

        if let Some(db) = &self.database {
            if db.max_connections == 0 {
                anyhow::bail!("Database max_connections must be greater than 0");
            }
        }

        Timezone::parse(&self.schedule.timezone)?;
        for cron in [
            &self.schedule.harvest_cron,
            &self.schedule.process_cron,
            &self.schedule.cleanup_cron,
        ]
        .into_iter()
        .flatten()
        {
            CronSpec::parse(cron)?;
        }

        if self.database.is_none() {
            tracing::warn!("DATABASE_URL not set - slot state is kept in memory only");
        }

        Ok(())
    }

    pub fn archive_settle_delay(&self) -> Duration {
        Duration::from_secs(self.pipeline.archive_settle_secs)
    }

    /// Recurring job settings; `process_selection` is the decoded `process_mask`
    pub fn recurring_schedules(&self, process_selection: SourceSelection) -> RecurringSchedules {
        RecurringSchedules {
            timezone: self.schedule.timezone.clone(),
            harvest_cron: self.schedule.harvest_cron.clone(),
            process_cron: self.schedule.process_cron.clone(),
            process_selection,
            process_clean_start: self.schedule.process_clean_start,
            process_promote: self.schedule.process_promote,
            cleanup_cron: self.schedule.cleanup_cron.clone(),
            report_ttl_days: self.reports.ttl_days,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig {
                upload_dir: DEFAULT_UPLOAD_DIR.into(),
                archive_settle_secs: DEFAULT_ARCHIVE_SETTLE_SECS,
                selection_layout: None,
                read_concurrency: DEFAULT_PROCESS_READ_CONCURRENCY,
            },
            reports: ReportConfig {
                dir: DEFAULT_REPORT_DIR.into(),
                ttl_days: DEFAULT_REPORT_TTL_DAYS,
                sample_guard: SampleGuard::default(),
            },
            database: None,
            schedule: ScheduleConfig {
                timezone: DEFAULT_SCHEDULE_TIMEZONE.to_string(),
                harvest_cron: Some(DEFAULT_HARVEST_CRON.to_string()),
                process_cron: Some(DEFAULT_PROCESS_CRON.to_string()),
                cleanup_cron: Some(DEFAULT_CLEANUP_CRON.to_string()),
                process_mask: None,
                process_clean_start: true,
                process_promote: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "OBSDP_UPLOAD_DIR",
        "OBSDP_ARCHIVE_SETTLE_SECS",
        "OBSDP_SELECTION_LAYOUT",
        "OBSDP_PROCESS_READ_CONCURRENCY",
        "OBSDP_REPORT_DIR",
        "OBSDP_REPORT_TTL_DAYS",
        "OBSDP_REPORT_SAMPLE_GUARD",
        "OBSDP_SCHEDULE_TIMEZONE",
        "OBSDP_HARVEST_CRON",
        "OBSDP_PROCESS_CRON",
        "OBSDP_REPORT_CLEANUP_CRON",
        "OBSDP_PROCESS_MASK",
        "OBSDP_PROCESS_CLEAN_START",
        "OBSDP_PROCESS_PROMOTE",
        "DATABASE_URL",
        "DATABASE_MAX_CONNECTIONS",
    ];

    fn clear() {
        for key in KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_from_env() {
        clear();
        std::env::set_var("OBSDP_REPORT_SAMPLE_GUARD", "sum");
        std::env::set_var("OBSDP_ARCHIVE_SETTLE_SECS", "0");
        std::env::set_var("OBSDP_HARVEST_CRON", "");
        std::env::set_var("OBSDP_PROCESS_MASK", "6");

        let config = Config::load().unwrap();
        assert_eq!(config.reports.sample_guard, SampleGuard::Sum);
        assert_eq!(config.archive_settle_delay(), Duration::ZERO);
        assert!(config.schedule.harvest_cron.is_none());
        assert_eq!(config.schedule.process_mask, Some(6));
        assert!(config.schedule.process_clean_start);
        clear();
    }

    #[test]
    #[serial]
    fn test_unset_values_fall_back_to_defaults() {
        clear();
        std::env::set_var("OBSDP_PROCESS_MASK", "  ");

        let config = Config::load().unwrap();
        assert_eq!(config.schedule.process_mask, None);
        assert!(config.schedule.process_promote);
        assert_eq!(config.reports.ttl_days, DEFAULT_REPORT_TTL_DAYS);
        clear();
    }

    #[test]
    #[serial]
    fn test_malformed_values_fail_loading() {
        for (key, value) in [
            ("OBSDP_PROCESS_MASK", "0b101"),
            ("OBSDP_PROCESS_CLEAN_START", "yes"),
            ("OBSDP_PROCESS_PROMOTE", "1"),
            ("OBSDP_REPORT_TTL_DAYS", "thirty"),
            ("DATABASE_MAX_CONNECTIONS", "-2"),
        ] {
            clear();
            std::env::set_var("DATABASE_URL", "postgres://localhost/obsdp");
            std::env::set_var(key, value);

            let err = Config::load().unwrap_err();
            let err = err
                .downcast_ref::<ObsdpError>()
                .expect("typed configuration error");
            assert!(matches!(err, ObsdpError::InvalidArgument(_)));
            assert!(err.to_string().contains(key), "{err} should name {key}");
        }
        clear();
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_rejected() {
        clear();
        std::env::set_var("OBSDP_REPORT_SAMPLE_GUARD", "strict");
        assert!(Config::load().is_err());
        clear();

        std::env::set_var("OBSDP_PROCESS_CRON", "whenever");
        assert!(Config::load().is_err());
        clear();

        std::env::set_var("OBSDP_SCHEDULE_TIMEZONE", "Mars/Olympus");
        assert!(Config::load().is_err());
        clear();
    }
}
