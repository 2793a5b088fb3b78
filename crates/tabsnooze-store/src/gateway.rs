// ABOUTME: StorageGateway owns the primary container and serializes every read-modify-write on it.
// ABOUTME: Exposes snooze/remove/import/export plus the scheduler's cleanup and reschedule operations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tabsnooze_core::{
    CURRENT_VERSION, Item, MigrationError, MigrationRegistry, RawEncoding, StorageContainer,
    is_restorable_url, sanitize, validate_container,
};
use thiserror::Error;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::backup::BackupManager;
use crate::config::{PRIMARY_KEY, StoreConfig};
use crate::kv::{BackendError, KeyValueStore, get_one, set_one};
use crate::notify::{Notification, Notifier, TracingNotifier, notify_best_effort};
use crate::recovery::{RecoveryOutcome, RecoveryService};
use crate::session::SessionSignals;

/// Notification id used for storage quota warnings.
pub const QUOTA_NOTIFICATION_ID: &str = "storage-quota";

/// Errors surfaced by gateway operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("payload is not a recognized snoozed-tabs export")]
    UnrecognizedPayload,

    #[error("item not found: {0}")]
    ItemNotFound(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),
}

/// One tab in a snooze request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabSnapshot {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub favicon: Option<String>,
}

impl TabSnapshot {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
            favicon: None,
        }
    }
}

/// A request to defer one or more tabs until `pop_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnoozeRequest {
    pub tabs: Vec<TabSnapshot>,
    pub pop_time: i64,
    /// Snooze the tabs as one window group, reopened together in order.
    #[serde(default)]
    pub as_group: bool,
}

/// Result of a snooze request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnoozeOutcome {
    pub ids: Vec<String>,
    pub group_id: Option<String>,
    /// URLs rejected because they can never be reopened.
    pub skipped: Vec<String>,
}

/// Result of an import.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImportReport {
    pub imported: usize,
    /// Items whose id collided with an existing one and got a fresh id.
    pub reassigned: usize,
    /// Items discarded by sanitizing the payload.
    pub dropped: usize,
}

/// What startup initialization found and did.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StartupReport {
    /// Schema version the stored data was migrated from, if any.
    pub migrated_from: Option<u32>,
    pub recovery: Option<RecoveryOutcome>,
    pub item_count: usize,
}

/// Normalized access to the backing key-value service. Every mutating
/// operation goes through a single async lock, so at most one
/// read-modify-write cycle over the container is in flight at a time.
pub struct StorageGateway {
    backend: Arc<dyn KeyValueStore>,
    session: SessionSignals,
    notifier: Arc<dyn Notifier>,
    migrations: MigrationRegistry,
    backups: BackupManager,
    config: StoreConfig,
    mutation_lock: Mutex<()>,
    quota_warned: AtomicBool,
}

impl StorageGateway {
    /// A gateway with no session service that logs its notifications.
    pub fn new(backend: Arc<dyn KeyValueStore>, config: StoreConfig) -> Self {
        Self {
            backups: BackupManager::new(Arc::clone(&backend), &config),
            backend,
            session: SessionSignals::absent(),
            notifier: Arc::new(TracingNotifier),
            migrations: MigrationRegistry::standard(),
            config,
            mutation_lock: Mutex::new(()),
            quota_warned: AtomicBool::new(false),
        }
    }

    pub fn with_session(mut self, session: Arc<dyn KeyValueStore>) -> Self {
        self.session = SessionSignals::new(Some(session));
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_migrations(mut self, migrations: MigrationRegistry) -> Self {
        self.migrations = migrations;
        self
    }

    pub fn session(&self) -> &SessionSignals {
        &self.session
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        Arc::clone(&self.notifier)
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    fn recovery_service(&self) -> RecoveryService {
        RecoveryService::new(
            Arc::clone(&self.backend),
            self.migrations.clone(),
            Arc::clone(&self.notifier),
            self.session.clone(),
        )
    }

    /// The raw primary blob, exactly as stored.
    pub async fn read_raw(&self) -> Result<Option<Value>, StoreError> {
        Ok(get_one(self.backend.as_ref(), PRIMARY_KEY).await?)
    }

    /// A fresh copy of the container. Older schemas are migrated in memory,
    /// a missing or wrong-typed `items`/`schedule` reads as empty, and
    /// structurally broken contents are read through `sanitize`. Fails only
    /// on backend errors or a missing migration step.
    pub async fn read(&self) -> Result<StorageContainer, StoreError> {
        let raw = self.read_raw().await?;
        self.normalize(raw)
    }

    fn normalize(&self, raw: Option<Value>) -> Result<StorageContainer, StoreError> {
        let Some(raw) = raw else {
            return Ok(StorageContainer::empty());
        };
        let upgraded = match self.migrations.upgrade(raw) {
            Ok((upgraded, _)) => upgraded,
            Err(MigrationError::Unrecognized) => Value::Object(Map::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(coerce(upgraded))
    }

    /// Persist the container, then arm the debounced backup and check quota.
    pub async fn write(&self, container: &StorageContainer) -> Result<(), StoreError> {
        set_one(self.backend.as_ref(), PRIMARY_KEY, container.to_value()).await?;
        self.backups.schedule();
        self.check_quota().await;
        Ok(())
    }

    /// Run one read-modify-write cycle under the mutation lock. The closure
    /// sees a fresh container; it is written back only if the closure
    /// succeeds. A failure is logged here and returned, and never blocks
    /// later mutations.
    pub async fn mutate<T, F>(&self, label: &str, apply: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut StorageContainer) -> Result<T, StoreError>,
    {
        let _guard = self.mutation_lock.lock().await;
        let result = async {
            let mut container = self.read_for_mutation().await?;
            let output = apply(&mut container)?;
            self.write(&container).await?;
            Ok(output)
        }
        .await;

        if let Err(e) = &result {
            tracing::error!("storage mutation '{}' failed: {}", label, e);
        }
        result
    }

    /// Read for a mutation, running recovery first if the stored container
    /// is unrecognized or fails validation. Caller holds the mutation lock.
    async fn read_for_mutation(&self) -> Result<StorageContainer, StoreError> {
        let Some(raw) = self.read_raw().await? else {
            return Ok(StorageContainer::empty());
        };
        match self.migrations.upgrade(raw) {
            Ok((upgraded, _)) if validate_container(&upgraded).is_ok() => Ok(coerce(upgraded)),
            Ok(_) | Err(MigrationError::Unrecognized) => {
                tracing::warn!("primary container is corrupt, running recovery");
                self.recovery_service().recover().await?;
                self.read().await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Startup check: create, migrate, or recover the primary container as
    /// needed. A missing migration step is fatal and propagates.
    pub async fn initialize(&self) -> Result<StartupReport, StoreError> {
        let _guard = self.mutation_lock.lock().await;
        let mut report = StartupReport::default();

        let Some(raw) = self.read_raw().await? else {
            tracing::info!("no stored container, initializing empty store");
            self.write(&StorageContainer::empty()).await?;
            return Ok(report);
        };

        let encoding = RawEncoding::classify(&raw);
        match self.migrations.upgrade(raw) {
            Ok((upgraded, _)) if validate_container(&upgraded).is_ok() => {
                let container = coerce(upgraded);
                if encoding != RawEncoding::Versioned(CURRENT_VERSION) {
                    report.migrated_from = encoding.version();
                    tracing::info!(
                        "upgraded stored container from {:?} to v{}",
                        encoding,
                        CURRENT_VERSION
                    );
                    self.write(&container).await?;
                }
                report.item_count = container.len();
            }
            Ok(_) | Err(MigrationError::Unrecognized) => {
                tracing::warn!("stored container failed validation at startup ({:?})", encoding);
                let outcome = self.recovery_service().recover().await?;
                report.item_count = outcome.item_count();
                report.recovery = Some(outcome);
                self.backups.schedule();
            }
            Err(e) => return Err(e.into()),
        }

        Ok(report)
    }

    /// Run recovery on demand, under the mutation lock.
    pub async fn recover(&self) -> Result<RecoveryOutcome, StoreError> {
        let _guard = self.mutation_lock.lock().await;
        let outcome = self.recovery_service().recover().await?;
        if outcome.recovered() {
            self.backups.schedule();
        }
        Ok(outcome)
    }

    /// Create items for every restorable tab in the request.
    pub async fn snooze(&self, request: SnoozeRequest) -> Result<SnoozeOutcome, StoreError> {
        let (tabs, skipped): (Vec<TabSnapshot>, Vec<TabSnapshot>) = request
            .tabs
            .into_iter()
            .partition(|tab| is_restorable_url(&tab.url));
        let skipped: Vec<String> = skipped.into_iter().map(|tab| tab.url).collect();
        if !skipped.is_empty() {
            tracing::warn!("refusing to snooze {} unrestorable tab(s)", skipped.len());
        }
        if tabs.is_empty() {
            return Ok(SnoozeOutcome {
                skipped,
                ..SnoozeOutcome::default()
            });
        }

        let group_id = request.as_group.then(|| Ulid::new().to_string());
        let pop_time = request.pop_time;
        let ids = self
            .mutate("snooze", |container| {
                let mut ids = Vec::with_capacity(tabs.len());
                for (position, tab) in tabs.into_iter().enumerate() {
                    let mut item = Item::new(container.fresh_id(), tab.url, pop_time);
                    item.title = tab.title;
                    item.favicon = tab.favicon;
                    if let Some(group_id) = &group_id {
                        item.group_id = Some(group_id.clone());
                        item.index = Some(position as i64);
                    }
                    ids.push(item.id.clone());
                    container.insert_item(item);
                }
                Ok(ids)
            })
            .await?;

        tracing::info!("snoozed {} tab(s) until {}", ids.len(), pop_time);
        Ok(SnoozeOutcome {
            ids,
            group_id,
            skipped,
        })
    }

    pub async fn remove_item(&self, id: &str) -> Result<Item, StoreError> {
        self.mutate("remove item", |container| {
            container
                .remove_item(id)
                .ok_or_else(|| StoreError::ItemNotFound(id.to_string()))
        })
        .await
    }

    /// Remove every item of a window group. Returns how many were removed.
    pub async fn remove_group(&self, group_id: &str) -> Result<usize, StoreError> {
        self.mutate("remove group", |container| {
            let members = container.group_members(group_id);
            if members.is_empty() {
                return Err(StoreError::GroupNotFound(group_id.to_string()));
            }
            for id in &members {
                container.remove_item(id);
            }
            Ok(members.len())
        })
        .await
    }

    /// Merge an exported (or legacy) payload into the store. The payload is
    /// migrated and sanitized first; ids already present get fresh ids.
    pub async fn import(&self, payload: Value) -> Result<ImportReport, StoreError> {
        let upgraded = match self.migrations.upgrade(payload) {
            Ok((upgraded, _)) => upgraded,
            Err(MigrationError::Unrecognized) => return Err(StoreError::UnrecognizedPayload),
            Err(e) => return Err(e.into()),
        };
        let offered = upgraded
            .get("items")
            .and_then(Value::as_object)
            .map_or(0, |items| items.len());
        let incoming = sanitize(&upgraded);
        let dropped = offered.saturating_sub(incoming.len());

        let report = self
            .mutate("import", |container| {
                let mut report = ImportReport {
                    dropped,
                    ..ImportReport::default()
                };
                for (_, mut item) in incoming.items {
                    if container.items.contains_key(&item.id) {
                        item.id = container.fresh_id();
                        report.reassigned += 1;
                    }
                    container.insert_item(item);
                    report.imported += 1;
                }
                Ok(report)
            })
            .await?;

        tracing::info!(
            "imported {} item(s) ({} reassigned, {} dropped)",
            report.imported,
            report.reassigned,
            report.dropped
        );
        Ok(report)
    }

    /// The current container in its export shape.
    pub async fn export(&self) -> Result<Value, StoreError> {
        Ok(self.read().await?.to_value())
    }

    /// Drop items that were reopened. Returns how many were still present.
    pub async fn remove_restored(&self, ids: &[String]) -> Result<usize, StoreError> {
        self.mutate("remove restored", |container| {
            Ok(ids
                .iter()
                .filter(|id| container.remove_item(id).is_some())
                .count())
        })
        .await
    }

    /// Move items to new due times. Items removed in the meantime are skipped.
    pub async fn reschedule(&self, updates: &[(String, i64)]) -> Result<usize, StoreError> {
        self.mutate("reschedule", |container| {
            Ok(updates
                .iter()
                .filter(|(id, pop_time)| container.reschedule(id, *pop_time))
                .count())
        })
        .await
    }

    /// Best-effort quota check; failures are only logged.
    async fn check_quota(&self) {
        let used = match self.backend.bytes_in_use(None).await {
            Ok(used) => used.unwrap_or(0),
            Err(e) => {
                tracing::warn!("could not read storage usage: {}", e);
                return;
            }
        };

        let threshold = self.config.quota_warn_threshold();
        if used < threshold {
            self.quota_warned.store(false, Ordering::SeqCst);
            return;
        }
        if self.quota_warned.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::warn!("storage usage {} bytes exceeds warning threshold {}", used, threshold);
        let percent = used.saturating_mul(100) / self.config.quota_bytes.max(1);
        notify_best_effort(
            self.notifier.as_ref(),
            QUOTA_NOTIFICATION_ID,
            Notification::basic(
                "Snoozed tabs storage nearly full",
                format!(
                    "Snoozed tabs use {}% of available storage. Remove some to make room.",
                    percent
                ),
            ),
        )
        .await;
    }
}

/// Coerce a migrated blob into a typed container without failing: a
/// wrong-typed `items`/`schedule` reads as empty and a missing version as
/// current. Contents that still fail validation go through `sanitize`.
fn coerce(mut raw: Value) -> StorageContainer {
    if !raw.is_object() {
        return StorageContainer::empty();
    }
    for field in ["items", "schedule"] {
        if !raw[field].is_object() {
            raw[field] = Value::Object(Map::new());
        }
    }
    let version = raw
        .get("version")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(CURRENT_VERSION);

    if validate_container(&raw).is_err() {
        tracing::warn!("stored container is inconsistent, reading sanitized view");
        let mut clean = sanitize(&raw);
        clean.version = version;
        return clean;
    }

    let mut container = StorageContainer::empty();
    container.version = version;
    if let Some(items) = raw["items"].as_object() {
        for (key, item) in items {
            if let Some(item) = Item::from_raw(item) {
                container.items.insert(key.clone(), item);
            }
        }
    }
    if let Some(schedule) = raw["schedule"].as_object() {
        for (time, ids) in schedule {
            let ids: Vec<String> = ids
                .as_array()
                .map(|ids| ids.iter().filter_map(|id| id.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            if !ids.is_empty() {
                container.schedule.insert(time.clone(), ids);
            }
        }
    }
    if !container.is_consistent() {
        tracing::debug!("rebuilding schedule for items outside their pop-time bucket");
        let mut rebuilt = sanitize(&container.to_value());
        rebuilt.version = version;
        return rebuilt;
    }
    container
}
