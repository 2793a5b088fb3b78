// ABOUTME: Backup selection and restore when the primary container fails validation.
// ABOUTME: Prefers the newest fully valid backup, else the backup that sanitizes to the most items.

use std::sync::Arc;

use serde_json::Value;
use tabsnooze_core::{CURRENT_VERSION, MigrationRegistry, StorageContainer, sanitize, validate_container};

use crate::backup::{Backup, list_backups};
use crate::config::PRIMARY_KEY;
use crate::kv::{BackendError, KeyValueStore, set_one};
use crate::notify::{Notification, Notifier, notify_best_effort};
use crate::session::SessionSignals;

/// Notification id used for recovery reports.
pub const RECOVERY_NOTIFICATION_ID: &str = "storage-recovery";

/// What a recovery run did to the primary container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// A backup was restored as the new primary.
    Restored {
        backup_timestamp: i64,
        item_count: usize,
        /// True when the backup had to be sanitized first.
        sanitized: bool,
    },
    /// No backup held any usable item; the primary was reset to empty.
    /// Lossy, but not fatal.
    Reset,
}

impl RecoveryOutcome {
    pub fn recovered(&self) -> bool {
        matches!(self, Self::Restored { .. })
    }

    pub fn item_count(&self) -> usize {
        match self {
            Self::Restored { item_count, .. } => *item_count,
            Self::Reset => 0,
        }
    }
}

/// Restores the primary container from backups.
pub struct RecoveryService {
    backend: Arc<dyn KeyValueStore>,
    migrations: MigrationRegistry,
    notifier: Arc<dyn Notifier>,
    session: SessionSignals,
}

impl RecoveryService {
    pub fn new(
        backend: Arc<dyn KeyValueStore>,
        migrations: MigrationRegistry,
        notifier: Arc<dyn Notifier>,
        session: SessionSignals,
    ) -> Self {
        Self {
            backend,
            migrations,
            notifier,
            session,
        }
    }

    /// Bring a backup to the current schema. A backup that cannot be
    /// migrated is treated as holding nothing.
    fn normalize(&self, backup: &Backup) -> Option<Value> {
        match self.migrations.upgrade(backup.data.clone()) {
            Ok((upgraded, _)) => Some(upgraded),
            Err(e) => {
                tracing::warn!("backup {} cannot be migrated: {}", backup.timestamp, e);
                None
            }
        }
    }

    /// Pick a backup and persist it as the new primary.
    ///
    /// Pass 1 takes the newest backup that validates unmodified. Pass 2
    /// sanitizes every backup and takes the one with the most surviving
    /// items, ties going to the newer one. If nothing survives, the primary
    /// is reset to an empty container.
    pub async fn recover(&self) -> Result<RecoveryOutcome, BackendError> {
        let backups = list_backups(self.backend.as_ref()).await?;
        let normalized: Vec<(i64, Option<Value>)> = backups
            .iter()
            .map(|b| (b.timestamp, self.normalize(b)))
            .collect();

        // Pass 1: first fully valid backup, newest first.
        for (timestamp, data) in &normalized {
            let Some(data) = data else { continue };
            if validate_container(data).is_ok() {
                let mut restored = data.clone();
                restored["version"] = Value::from(CURRENT_VERSION);
                let item_count = restored["items"].as_object().map_or(0, |items| items.len());
                set_one(self.backend.as_ref(), PRIMARY_KEY, restored).await?;

                tracing::info!(
                    "restored valid backup {} with {} item(s)",
                    timestamp,
                    item_count
                );
                let outcome = RecoveryOutcome::Restored {
                    backup_timestamp: *timestamp,
                    item_count,
                    sanitized: false,
                };
                self.report(&outcome).await;
                return Ok(outcome);
            }
        }

        // Pass 2: most items after sanitizing; strict comparison keeps the newer on ties.
        let mut best: Option<(i64, StorageContainer)> = None;
        for (timestamp, data) in &normalized {
            let candidate = sanitize(data.as_ref().unwrap_or(&Value::Null));
            let better = best
                .as_ref()
                .is_none_or(|(_, current)| candidate.len() > current.len());
            if better {
                best = Some((*timestamp, candidate));
            }
        }

        let outcome = match best {
            Some((timestamp, container)) if !container.is_empty() => {
                let item_count = container.len();
                set_one(self.backend.as_ref(), PRIMARY_KEY, container.to_value()).await?;
                tracing::warn!(
                    "restored sanitized backup {} with {} item(s)",
                    timestamp,
                    item_count
                );
                RecoveryOutcome::Restored {
                    backup_timestamp: timestamp,
                    item_count,
                    sanitized: true,
                }
            }
            _ => {
                set_one(
                    self.backend.as_ref(),
                    PRIMARY_KEY,
                    StorageContainer::empty().to_value(),
                )
                .await?;
                tracing::error!(
                    "no usable backup among {}; primary reset to empty",
                    normalized.len()
                );
                RecoveryOutcome::Reset
            }
        };

        self.report(&outcome).await;
        Ok(outcome)
    }

    async fn report(&self, outcome: &RecoveryOutcome) {
        let notification = match outcome {
            RecoveryOutcome::Restored { item_count, .. } => {
                if let Err(e) = self.session.set_pending_recovery(*item_count).await {
                    tracing::warn!("could not record pending recovery: {}", e);
                }
                let noun = if *item_count == 1 { "tab" } else { "tabs" };
                Notification::basic(
                    "Snoozed tabs recovered",
                    format!(
                        "Your snoozed tabs were damaged. Recovered {} snoozed {} from a backup.",
                        item_count, noun
                    ),
                )
            }
            RecoveryOutcome::Reset => Notification::basic(
                "Snoozed tabs could not be recovered",
                "Your snoozed tabs were damaged and no usable backup was found.",
            ),
        };
        notify_best_effort(self.notifier.as_ref(), RECOVERY_NOTIFICATION_ID, notification).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BACKUP_KEY_PREFIX;
    use crate::kv::{MemoryKv, get_one};
    use crate::notify::RecordingNotifier;
    use serde_json::json;

    fn item(id: &str) -> Value {
        json!({"id": id, "url": format!("https://example.com/{}", id), "creationTime": 1, "popTime": 1000})
    }

    fn container_with(ids: &[&str]) -> Value {
        let mut items = serde_json::Map::new();
        for id in ids {
            items.insert(id.to_string(), item(id));
        }
        json!({"version": 2, "items": items, "schedule": {"1000": ids}})
    }

    /// A container with `good` valid items plus one dangling schedule id.
    fn corrupt_with(good: &[&str]) -> Value {
        let mut data = container_with(good);
        data["schedule"]["9999"] = json!(["ghost"]);
        data
    }

    struct Fixture {
        backend: Arc<MemoryKv>,
        notifier: Arc<RecordingNotifier>,
        session: SessionSignals,
        service: RecoveryService,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryKv::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let session = SessionSignals::new(Some(Arc::new(MemoryKv::new())));
        let service = RecoveryService::new(
            backend.clone(),
            MigrationRegistry::standard(),
            notifier.clone(),
            session.clone(),
        );
        Fixture {
            backend,
            notifier,
            session,
            service,
        }
    }

    async fn seed_backup(backend: &MemoryKv, timestamp: i64, data: Value) {
        set_one(backend, &format!("{}{}", BACKUP_KEY_PREFIX, timestamp), data)
            .await
            .unwrap();
    }

    async fn primary(backend: &MemoryKv) -> Value {
        get_one(backend, PRIMARY_KEY).await.unwrap().expect("primary written")
    }

    #[tokio::test]
    async fn valid_older_backup_beats_invalid_newer() {
        let f = fixture();
        seed_backup(&f.backend, 100, container_with(&["a"])).await;
        seed_backup(&f.backend, 200, corrupt_with(&["x", "y", "z"])).await;

        let outcome = f.service.recover().await.unwrap();

        assert_eq!(
            outcome,
            RecoveryOutcome::Restored {
                backup_timestamp: 100,
                item_count: 1,
                sanitized: false
            }
        );
        let restored = primary(&f.backend).await;
        assert!(restored["items"].get("a").is_some());
        assert_eq!(f.session.pending_recovery().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn newest_valid_backup_wins_pass_one() {
        let f = fixture();
        seed_backup(&f.backend, 100, container_with(&["a", "b"])).await;
        seed_backup(&f.backend, 200, container_with(&["c"])).await;

        let outcome = f.service.recover().await.unwrap();
        assert!(matches!(outcome, RecoveryOutcome::Restored { backup_timestamp: 200, .. }));
    }

    #[tokio::test]
    async fn invalid_backups_pick_most_items() {
        let f = fixture();
        seed_backup(&f.backend, 100, corrupt_with(&["a", "b", "c"])).await;
        seed_backup(&f.backend, 200, corrupt_with(&["d"])).await;

        let outcome = f.service.recover().await.unwrap();

        assert_eq!(
            outcome,
            RecoveryOutcome::Restored {
                backup_timestamp: 100,
                item_count: 3,
                sanitized: true
            }
        );
        let restored = primary(&f.backend).await;
        assert!(validate_container(&restored).is_ok());
        assert_eq!(restored["version"], 2);
    }

    #[tokio::test]
    async fn ties_go_to_the_newer_backup() {
        let f = fixture();
        seed_backup(&f.backend, 100, corrupt_with(&["old1", "old2"])).await;
        seed_backup(&f.backend, 300, corrupt_with(&["new1", "new2"])).await;
        seed_backup(&f.backend, 200, corrupt_with(&["mid"])).await;

        let outcome = f.service.recover().await.unwrap();
        assert!(matches!(
            outcome,
            RecoveryOutcome::Restored { backup_timestamp: 300, item_count: 2, sanitized: true }
        ));
        assert!(primary(&f.backend).await["items"].get("new1").is_some());
    }

    #[tokio::test]
    async fn nothing_usable_resets_to_empty() {
        let f = fixture();
        seed_backup(&f.backend, 100, json!("garbage")).await;
        seed_backup(&f.backend, 200, json!({"items": [], "schedule": 3})).await;

        let outcome = f.service.recover().await.unwrap();

        assert_eq!(outcome, RecoveryOutcome::Reset);
        assert!(!outcome.recovered());
        let restored = primary(&f.backend).await;
        assert_eq!(restored, StorageContainer::empty().to_value());

        let notes = f.notifier.notifications().await;
        assert_eq!(notes.len(), 1);
        assert!(notes[0].1.title.contains("could not be recovered"));
        assert_eq!(f.session.pending_recovery().await.unwrap(), None);
    }

    #[tokio::test]
    async fn legacy_backup_is_migrated_before_evaluation() {
        let f = fixture();
        seed_backup(
            &f.backend,
            100,
            json!({"tabCount": 1, "5000": [{"id": "old", "url": "https://legacy.example", "creationTime": 1}]}),
        )
        .await;

        let outcome = f.service.recover().await.unwrap();
        assert!(matches!(outcome, RecoveryOutcome::Restored { item_count: 1, sanitized: false, .. }));
        let restored = primary(&f.backend).await;
        assert_eq!(restored["items"]["old"]["popTime"], 5000);
        assert_eq!(restored["version"], 2);
    }

    #[tokio::test]
    async fn no_backups_at_all_resets() {
        let f = fixture();
        assert_eq!(f.service.recover().await.unwrap(), RecoveryOutcome::Reset);
    }
}
