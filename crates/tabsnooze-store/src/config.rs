// ABOUTME: Tunables for the persistence layer and the well-known storage keys it uses.
// ABOUTME: Defaults match a browser extension's local storage quota and a short backup quiet period.

use std::time::Duration;

/// Key holding the primary container in the backing store.
pub const PRIMARY_KEY: &str = "snoozedTabs";

/// Prefix of timestamp-keyed backup slots: `snoozedTabs_backup_<epoch ms>`.
pub const BACKUP_KEY_PREFIX: &str = "snoozedTabs_backup_";

/// Session key holding the item count restored by the last recovery.
pub const PENDING_RECOVERY_KEY: &str = "pendingRecovery";

/// Session key holding summaries of items whose restore failed.
pub const FAILED_RESTORES_KEY: &str = "failedRestores";

/// Persistence-layer configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Quiet period after the last write before a backup is taken.
    pub backup_debounce: Duration,
    /// Number of backup snapshots retained, including the newest.
    pub backup_retention: usize,
    /// Storage quota of the backing service in bytes.
    pub quota_bytes: u64,
    /// Fraction of the quota at which a "nearly full" warning is raised.
    pub quota_warn_ratio: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backup_debounce: Duration::from_secs(2),
            backup_retention: 5,
            quota_bytes: 10 * 1024 * 1024,
            quota_warn_ratio: 0.8,
        }
    }
}

impl StoreConfig {
    /// Usage in bytes above which the quota warning fires.
    pub fn quota_warn_threshold(&self) -> u64 {
        (self.quota_bytes as f64 * self.quota_warn_ratio) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_threshold_is_eighty_percent() {
        let config = StoreConfig::default();
        assert_eq!(config.backup_retention, 5);
        assert_eq!(config.quota_warn_threshold(), 8_388_608);
    }
}
