// ABOUTME: Configuration loading for the tabsnooze binary from TABSNOOZE_* environment variables.
// ABOUTME: Builds the store and scheduler configs and rejects unusable values up front.

use std::path::PathBuf;
use std::time::Duration;

use tabsnooze_scheduler::SchedulerConfig;
use tabsnooze_store::StoreConfig;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is not a valid non-negative number: {value}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("TABSNOOZE_BACKUP_RETENTION must keep at least one backup")]
    ZeroRetention,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub home: PathBuf,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
}

fn env_number(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        _ => Ok(None),
    }
}

impl AppConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - TABSNOOZE_HOME: data directory (default: ~/.tabsnooze)
    /// - TABSNOOZE_BACKUP_RETENTION: backups kept (default: 5)
    /// - TABSNOOZE_BACKUP_DEBOUNCE_MS: quiet period before a backup (default: 2000)
    /// - TABSNOOZE_TICK_SECS: seconds between restoration passes (default: 60)
    /// - TABSNOOZE_RETRY_DELAY_MS: delay between restore attempts (default: 1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = std::env::var("TABSNOOZE_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("/tmp"))
                    .join(".tabsnooze")
            });

        let mut store = StoreConfig::default();
        if let Some(retention) = env_number("TABSNOOZE_BACKUP_RETENTION")? {
            if retention == 0 {
                return Err(ConfigError::ZeroRetention);
            }
            store.backup_retention = retention as usize;
        }
        if let Some(ms) = env_number("TABSNOOZE_BACKUP_DEBOUNCE_MS")? {
            store.backup_debounce = Duration::from_millis(ms);
        }

        let mut scheduler = SchedulerConfig::default();
        if let Some(secs) = env_number("TABSNOOZE_TICK_SECS")? {
            scheduler.tick_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = env_number("TABSNOOZE_RETRY_DELAY_MS")? {
            scheduler.retry_delay = Duration::from_millis(ms);
        }

        Ok(Self {
            home,
            store,
            scheduler,
        })
    }

    /// The SQLite database holding the snoozed-tab store.
    pub fn database_path(&self) -> PathBuf {
        self.home.join("tabsnooze.db")
    }
}
