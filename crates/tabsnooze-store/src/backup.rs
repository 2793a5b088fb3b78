// ABOUTME: Debounced, validated snapshots of the primary container with bounded retention.
// ABOUTME: Each write re-arms an owned timer task; only the last write in a quiet period is snapshotted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tabsnooze_core::{now_millis, validate_container};
use tokio::task::JoinHandle;

use crate::config::{BACKUP_KEY_PREFIX, PRIMARY_KEY, StoreConfig};
use crate::kv::{BackendError, KeyValueStore, get_one};

/// One stored backup snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Backup {
    pub key: String,
    pub timestamp: i64,
    pub data: Value,
}

/// Parse the timestamp out of a backup slot key.
fn backup_timestamp(key: &str) -> Option<i64> {
    key.strip_prefix(BACKUP_KEY_PREFIX)?.parse().ok()
}

fn backup_key(timestamp: i64) -> String {
    format!("{}{}", BACKUP_KEY_PREFIX, timestamp)
}

/// All backups in the store, newest first.
pub async fn list_backups(backend: &dyn KeyValueStore) -> Result<Vec<Backup>, BackendError> {
    let all = backend.get(None).await?;
    let mut backups: Vec<Backup> = all
        .into_iter()
        .filter_map(|(key, data)| {
            backup_timestamp(&key).map(|timestamp| Backup {
                key,
                timestamp,
                data,
            })
        })
        .collect();
    backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(backups)
}

struct Snapshotter {
    backend: Arc<dyn KeyValueStore>,
    retention: usize,
}

impl Snapshotter {
    /// Snapshot the current primary if it validates, then prune old slots.
    /// Returns the new backup's timestamp, or `None` if skipped.
    async fn snapshot(&self) -> Result<Option<i64>, BackendError> {
        let Some(current) = get_one(self.backend.as_ref(), PRIMARY_KEY).await? else {
            tracing::debug!("no primary container yet, skipping backup");
            return Ok(None);
        };

        if let Err(e) = validate_container(&current) {
            tracing::warn!("skipping backup of invalid container: {}", e);
            return Ok(None);
        }

        let existing = list_backups(self.backend.as_ref()).await?;
        let mut timestamp = now_millis();
        while existing.iter().any(|b| b.timestamp == timestamp) {
            timestamp += 1;
        }

        let mut entries = Map::new();
        entries.insert(backup_key(timestamp), current);
        self.backend.set(entries).await?;
        tracing::info!("wrote backup {}", timestamp);

        let stale: Vec<String> = list_backups(self.backend.as_ref())
            .await?
            .into_iter()
            .skip(self.retention)
            .map(|b| b.key)
            .collect();
        if !stale.is_empty() {
            self.backend.remove(&stale).await?;
            tracing::info!("pruned {} old backup(s)", stale.len());
        }

        Ok(Some(timestamp))
    }
}

/// A debounced snapshot task. `claimed` is set by whichever side gets
/// there first: the timer when it fires, or a canceller while it sleeps.
struct PendingBackup {
    task: JoinHandle<()>,
    claimed: Arc<AtomicBool>,
}

impl PendingBackup {
    /// Stop the timer if it has not fired yet. Returns false when the
    /// snapshot has already started; it is left to run to completion.
    fn cancel(&self) -> bool {
        if self.claimed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.task.abort();
        true
    }

    fn is_waiting(&self) -> bool {
        !self.claimed.load(Ordering::SeqCst)
    }
}

/// Owns the debounce timer and writes rotating backups of the primary container.
pub struct BackupManager {
    snapshotter: Arc<Snapshotter>,
    debounce: Duration,
    pending: Mutex<Option<PendingBackup>>,
}

impl BackupManager {
    pub fn new(backend: Arc<dyn KeyValueStore>, config: &StoreConfig) -> Self {
        Self {
            snapshotter: Arc::new(Snapshotter {
                backend,
                retention: config.backup_retention.max(1),
            }),
            debounce: config.backup_debounce,
            pending: Mutex::new(None),
        }
    }

    /// (Re)start the debounce timer. Any snapshot still waiting is cancelled,
    /// so a burst of writes yields a single snapshot of the final state. A
    /// snapshot that is already being written is never interrupted.
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self) {
        let snapshotter = Arc::clone(&self.snapshotter);
        let debounce = self.debounce;
        let claimed = Arc::new(AtomicBool::new(false));
        let fired = Arc::clone(&claimed);
        let task = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if fired.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Err(e) = snapshotter.snapshot().await {
                tracing::error!("debounced backup failed: {}", e);
            }
        });

        if let Some(previous) = self.replace_pending(Some(PendingBackup { task, claimed })) {
            if !previous.cancel() {
                tracing::debug!("previous backup already writing, letting it finish");
            }
        }
    }

    /// Cancel a pending debounced snapshot, if any. One already being
    /// written runs to completion.
    pub fn cancel(&self) {
        if let Some(previous) = self.replace_pending(None) {
            previous.cancel();
        }
    }

    /// True while a debounced snapshot is waiting to fire.
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .map(|slot| slot.as_ref().is_some_and(PendingBackup::is_waiting))
            .unwrap_or(false)
    }

    /// Snapshot immediately, bypassing the debounce.
    pub async fn snapshot_now(&self) -> Result<Option<i64>, BackendError> {
        self.snapshotter.snapshot().await
    }

    /// Cancel any pending timer and snapshot now if one was pending. A
    /// snapshot that had already fired is awaited instead.
    pub async fn flush(&self) -> Result<Option<i64>, BackendError> {
        let Some(pending) = self.replace_pending(None) else {
            return Ok(None);
        };
        if pending.cancel() {
            return self.snapshot_now().await;
        }
        if let Err(e) = pending.task.await {
            tracing::warn!("debounced backup did not complete: {}", e);
        }
        Ok(None)
    }

    pub async fn list(&self) -> Result<Vec<Backup>, BackendError> {
        list_backups(self.snapshotter.backend.as_ref()).await
    }

    fn replace_pending(&self, task: Option<PendingBackup>) -> Option<PendingBackup> {
        match self.pending.lock() {
            Ok(mut slot) => std::mem::replace(&mut *slot, task),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), task),
        }
    }
}

impl Drop for BackupManager {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{MemoryKv, set_one};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn valid_container(n: usize) -> Value {
        let mut items = Map::new();
        let mut ids = Vec::new();
        for i in 0..n {
            let id = format!("id{}", i);
            items.insert(
                id.clone(),
                json!({"id": id, "url": "https://example.com", "creationTime": 1, "popTime": 1000}),
            );
            ids.push(json!(id));
        }
        json!({"version": 2, "items": items, "schedule": {"1000": ids}})
    }

    fn manager(backend: Arc<MemoryKv>, debounce_ms: u64, retention: usize) -> BackupManager {
        let config = StoreConfig {
            backup_debounce: Duration::from_millis(debounce_ms),
            backup_retention: retention,
            ..StoreConfig::default()
        };
        BackupManager::new(backend, &config)
    }

    #[tokio::test]
    async fn debounce_snapshots_only_last_write() {
        let backend = Arc::new(MemoryKv::new());
        let backups = manager(Arc::clone(&backend), 100, 5);

        for n in 1..=3 {
            set_one(backend.as_ref(), PRIMARY_KEY, valid_container(n)).await.unwrap();
            backups.schedule();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(backups.is_pending());

        tokio::time::sleep(Duration::from_millis(400)).await;

        let list = backups.list().await.unwrap();
        assert_eq!(list.len(), 1, "a burst of writes yields one snapshot");
        assert_eq!(list[0].data["items"].as_object().unwrap().len(), 3);
        assert!(!backups.is_pending());
    }

    #[tokio::test]
    async fn invalid_container_is_never_snapshotted() {
        let backend = Arc::new(MemoryKv::new());
        let backups = manager(Arc::clone(&backend), 10, 5);

        set_one(
            backend.as_ref(),
            PRIMARY_KEY,
            json!({"version": 2, "items": {}, "schedule": {"1": ["ghost"]}}),
        )
        .await
        .unwrap();

        assert_eq!(backups.snapshot_now().await.unwrap(), None);
        assert!(backups.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retention_prunes_oldest() {
        let backend = Arc::new(MemoryKv::new());
        let backups = manager(Arc::clone(&backend), 10, 3);

        // Seed old slots directly so timestamps are deterministic.
        for ts in [100i64, 200, 300] {
            set_one(backend.as_ref(), &backup_key(ts), valid_container(1)).await.unwrap();
        }
        set_one(backend.as_ref(), PRIMARY_KEY, valid_container(2)).await.unwrap();

        let newest = backups.snapshot_now().await.unwrap().expect("snapshot written");

        let list = backups.list().await.unwrap();
        let stamps: Vec<i64> = list.iter().map(|b| b.timestamp).collect();
        assert_eq!(stamps, vec![newest, 300, 200]);
    }

    #[tokio::test]
    async fn flush_writes_pending_snapshot_immediately() {
        let backend = Arc::new(MemoryKv::new());
        let backups = manager(Arc::clone(&backend), 60_000, 5);

        set_one(backend.as_ref(), PRIMARY_KEY, valid_container(1)).await.unwrap();
        backups.schedule();

        assert!(backups.flush().await.unwrap().is_some());
        assert_eq!(backups.list().await.unwrap().len(), 1);
        assert!(!backups.is_pending());
        assert_eq!(backups.flush().await.unwrap(), None);
    }

    #[tokio::test]
    async fn snapshot_failure_does_not_escape_timer() {
        let backend = Arc::new(MemoryKv::new());
        let backups = manager(Arc::clone(&backend), 10, 5);

        backend.set_unavailable(true);
        backups.schedule();
        tokio::time::sleep(Duration::from_millis(100)).await;
        backend.set_unavailable(false);

        assert!(backups.list().await.unwrap().is_empty());
    }

    /// Backend whose writes take `delay` to land.
    struct SlowWritesKv {
        inner: MemoryKv,
        delay: Duration,
        completed_sets: AtomicUsize,
    }

    #[async_trait]
    impl KeyValueStore for SlowWritesKv {
        async fn get(&self, keys: Option<&[String]>) -> Result<Map<String, Value>, BackendError> {
            self.inner.get(keys).await
        }

        async fn set(&self, entries: Map<String, Value>) -> Result<(), BackendError> {
            tokio::time::sleep(self.delay).await;
            self.inner.set(entries).await?;
            self.completed_sets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn remove(&self, keys: &[String]) -> Result<(), BackendError> {
            self.inner.remove(keys).await
        }
    }

    async fn slow_manager(retention: usize) -> (Arc<SlowWritesKv>, BackupManager) {
        let backend = Arc::new(SlowWritesKv {
            inner: MemoryKv::new(),
            delay: Duration::from_millis(100),
            completed_sets: AtomicUsize::new(0),
        });
        for ts in [100i64, 200] {
            set_one(&backend.inner, &backup_key(ts), valid_container(1)).await.unwrap();
        }
        set_one(&backend.inner, PRIMARY_KEY, valid_container(2)).await.unwrap();
        let config = StoreConfig {
            backup_debounce: Duration::from_millis(10),
            backup_retention: retention,
            ..StoreConfig::default()
        };
        let backups = BackupManager::new(backend.clone(), &config);
        (backend, backups)
    }

    #[tokio::test]
    async fn cancel_leaves_a_snapshot_in_progress_alone() {
        let (backend, backups) = slow_manager(2).await;

        backups.schedule();
        // Past the debounce, inside the slow write.
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!backups.is_pending());
        backups.cancel();
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(backend.completed_sets.load(Ordering::SeqCst), 1);
        let stamps: Vec<i64> = backups.list().await.unwrap().iter().map(|b| b.timestamp).collect();
        assert_eq!(stamps.len(), 2);
        assert!(stamps[0] > 200);
        assert_eq!(stamps[1], 200);
    }

    #[tokio::test]
    async fn rescheduling_during_a_snapshot_keeps_retention() {
        let (backend, backups) = slow_manager(2).await;

        backups.schedule();
        tokio::time::sleep(Duration::from_millis(40)).await;
        backups.schedule();
        assert!(backups.is_pending());
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(backend.completed_sets.load(Ordering::SeqCst), 2);
        let list = backups.list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|b| b.timestamp > 200));
    }

    #[tokio::test]
    async fn flush_waits_for_a_snapshot_in_progress() {
        let (backend, backups) = slow_manager(5).await;

        backups.schedule();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(backups.flush().await.unwrap(), None);
        assert_eq!(backend.completed_sets.load(Ordering::SeqCst), 1);
        assert_eq!(backups.list().await.unwrap().len(), 3);
    }

    #[test]
    fn parses_backup_keys() {
        assert_eq!(backup_timestamp("snoozedTabs_backup_1234"), Some(1234));
        assert_eq!(backup_timestamp("snoozedTabs"), None);
        assert_eq!(backup_timestamp("snoozedTabs_backup_x"), None);
    }
}
