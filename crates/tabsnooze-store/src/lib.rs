// ABOUTME: Persistence layer for tabsnooze, owning the stored container and everything that touches it.
// ABOUTME: Provides the key-value gateway with a serialized mutation lock, debounced backups, and recovery.

pub mod backup;
pub mod config;
pub mod gateway;
pub mod kv;
pub mod notify;
pub mod recovery;
pub mod session;
pub mod sqlite;

pub use backup::{Backup, BackupManager, list_backups};
pub use config::{
    BACKUP_KEY_PREFIX, FAILED_RESTORES_KEY, PENDING_RECOVERY_KEY, PRIMARY_KEY, StoreConfig,
};
pub use gateway::{
    ImportReport, QUOTA_NOTIFICATION_ID, SnoozeOutcome, SnoozeRequest, StartupReport,
    StorageGateway, StoreError, TabSnapshot,
};
pub use kv::{BackendError, KeyValueStore, MemoryKv, get_one, set_one};
pub use notify::{
    Notification, Notifier, NotifyError, RecordingNotifier, TracingNotifier, notify_best_effort,
};
pub use recovery::{RECOVERY_NOTIFICATION_ID, RecoveryOutcome, RecoveryService};
pub use session::SessionSignals;
pub use sqlite::SqliteKv;
