// ABOUTME: Schema detection and ordered, single-step migrations of raw stored blobs.
// ABOUTME: Classifies raw shapes into known encodings and upgrades them through an explicit step table.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::model::{CURRENT_VERSION, Item, StorageContainer, millis_from_value, now_millis};
use crate::restorable::is_restorable_url;

/// Counter field present at the top level of pre-versioning stores.
pub const LEGACY_COUNTER_KEY: &str = "tabCount";

/// Errors that can occur while upgrading a raw blob.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MigrationError {
    /// No step is registered to upgrade from this version. Fatal: a version
    /// is never skipped.
    #[error("no migration registered from schema version {version}")]
    Gap { version: u32 },

    #[error("schema version {found} is newer than the latest supported version {latest}")]
    Unsupported { found: u32, latest: u32 },

    #[error("unrecognized storage shape")]
    Unrecognized,

    #[error("malformed input for migration from version {version}: {reason}")]
    Malformed { version: u32, reason: String },
}

/// The known raw encodings a stored blob can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEncoding {
    /// Null, non-object, array, or an object matching no known shape.
    Unrecognized,
    /// Pre-versioning store: timestamp-keyed buckets plus a counter.
    LegacyV1,
    /// `{items, schedule}`, or an `items` map alone, without an explicit
    /// version field.
    UnversionedV2,
    /// Carries an explicit numeric `version` field.
    Versioned(u32),
}

impl RawEncoding {
    /// Classify a raw blob by its shape.
    pub fn classify(raw: &Value) -> Self {
        let Some(obj) = raw.as_object() else {
            return Self::Unrecognized;
        };

        if let Some(version) = obj.get("version").filter(|v| v.is_number()) {
            return millis_from_value(version)
                .and_then(|v| u32::try_from(v).ok())
                .map_or(Self::Unrecognized, Self::Versioned);
        }

        if obj.contains_key(LEGACY_COUNTER_KEY) || obj.keys().any(|k| k.parse::<i64>().is_ok()) {
            return Self::LegacyV1;
        }

        // An `items` map alone is enough; a missing schedule is rebuilt later.
        let items_map = obj.get("items").is_some_and(Value::is_object);
        if items_map || (obj.contains_key("items") && obj.contains_key("schedule")) {
            return Self::UnversionedV2;
        }

        Self::Unrecognized
    }

    /// The schema version this encoding corresponds to, if known.
    pub fn version(self) -> Option<u32> {
        match self {
            Self::Unrecognized => None,
            Self::LegacyV1 => Some(1),
            Self::UnversionedV2 => Some(2),
            Self::Versioned(v) => Some(v),
        }
    }
}

/// Detect the schema version of a raw blob, or `None` if unrecognized.
pub fn detect_version(raw: &Value) -> Option<u32> {
    RawEncoding::classify(raw).version()
}

/// Upgrades a blob from version `n` to version `n + 1`.
pub type MigrationStep = fn(Value) -> Result<Value, MigrationError>;

/// Explicit table of single-step upgrades keyed by source version.
#[derive(Debug, Clone)]
pub struct MigrationRegistry {
    steps: BTreeMap<u32, MigrationStep>,
    latest: u32,
}

impl Default for MigrationRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl MigrationRegistry {
    /// A registry with no steps targeting `latest`.
    pub fn empty(latest: u32) -> Self {
        Self {
            steps: BTreeMap::new(),
            latest,
        }
    }

    /// The steps shipped with this build, targeting `CURRENT_VERSION`.
    pub fn standard() -> Self {
        Self::empty(CURRENT_VERSION).with_step(1, migrate_legacy_to_current)
    }

    /// Register the step that upgrades `from` to `from + 1`.
    pub fn with_step(mut self, from: u32, step: MigrationStep) -> Self {
        self.steps.insert(from, step);
        self
    }

    pub fn latest(&self) -> u32 {
        self.latest
    }

    /// Apply registered steps in order until `to` is reached.
    pub fn run_migrations(&self, data: Value, from: u32, to: u32) -> Result<Value, MigrationError> {
        if from == to {
            return Ok(data);
        }
        if from > to {
            return Err(MigrationError::Unsupported {
                found: from,
                latest: to,
            });
        }

        let mut current = from;
        let mut data = data;
        while current < to {
            let step = self
                .steps
                .get(&current)
                .ok_or(MigrationError::Gap { version: current })?;
            data = step(data)?;
            tracing::info!("migrated storage schema v{} -> v{}", current, current + 1);
            current += 1;
        }
        Ok(data)
    }

    /// Classify a raw blob and upgrade it to the latest version. The result
    /// always carries an explicit `version` field.
    pub fn upgrade(&self, raw: Value) -> Result<(Value, RawEncoding), MigrationError> {
        let encoding = RawEncoding::classify(&raw);
        let version = encoding.version().ok_or(MigrationError::Unrecognized)?;
        let mut upgraded = self.run_migrations(raw, version, self.latest)?;
        if let Some(obj) = upgraded.as_object_mut()
            && !obj.contains_key("version")
        {
            obj.insert("version".to_string(), Value::from(self.latest));
        }
        Ok((upgraded, encoding))
    }
}

/// The v1 -> v2 step: convert timestamp-keyed legacy buckets into an item map
/// plus schedule. Entries whose URL can never be reopened are dropped.
pub fn migrate_legacy_to_current(data: Value) -> Result<Value, MigrationError> {
    let Value::Object(legacy) = data else {
        return Err(MigrationError::Malformed {
            version: 1,
            reason: "legacy store is not an object".to_string(),
        });
    };

    let mut container = StorageContainer::empty();
    container.version = 2;
    let mut skipped = 0usize;

    for (key, bucket) in &legacy {
        if key == LEGACY_COUNTER_KEY {
            continue;
        }
        let Ok(bucket_time) = key.parse::<i64>() else {
            continue;
        };
        let Some(entries) = bucket.as_array() else {
            continue;
        };

        for entry in entries {
            let Some(fields) = entry.as_object() else {
                skipped += 1;
                continue;
            };
            let url = fields.get("url").and_then(Value::as_str).unwrap_or_default();
            if !is_restorable_url(url) {
                skipped += 1;
                continue;
            }

            let id = match fields.get("id").and_then(Value::as_str) {
                Some(id) if !id.is_empty() && !container.items.contains_key(id) => id.to_string(),
                _ => container.fresh_id(),
            };
            let text = |name: &str| fields.get(name).and_then(Value::as_str).map(str::to_string);

            let item = Item {
                id,
                url: url.to_string(),
                title: text("title"),
                favicon: text("favicon"),
                creation_time: fields
                    .get("creationTime")
                    .and_then(millis_from_value)
                    .unwrap_or_else(now_millis),
                pop_time: fields
                    .get("popTime")
                    .and_then(millis_from_value)
                    .unwrap_or(bucket_time),
                group_id: text("groupId"),
                index: fields.get("index").and_then(millis_from_value),
            };
            container.insert_item(item);
        }
    }

    if skipped > 0 {
        tracing::warn!("legacy migration skipped {} unrestorable entries", skipped);
    }

    Ok(container.to_value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bump_to_v3(mut data: Value) -> Result<Value, MigrationError> {
        if let Some(obj) = data.as_object_mut() {
            obj.insert("version".to_string(), json!(3));
            obj.insert("migratedTo3".to_string(), json!(true));
        }
        Ok(data)
    }

    #[test]
    fn classify_known_shapes() {
        assert_eq!(RawEncoding::classify(&json!(null)), RawEncoding::Unrecognized);
        assert_eq!(RawEncoding::classify(&json!([1])), RawEncoding::Unrecognized);
        assert_eq!(RawEncoding::classify(&json!("v2")), RawEncoding::Unrecognized);
        assert_eq!(RawEncoding::classify(&json!({"foo": 1})), RawEncoding::Unrecognized);
        assert_eq!(
            RawEncoding::classify(&json!({"version": 7, "items": {}})),
            RawEncoding::Versioned(7)
        );
        assert_eq!(RawEncoding::classify(&json!({"tabCount": 0})), RawEncoding::LegacyV1);
        assert_eq!(RawEncoding::classify(&json!({"1700000000000": []})), RawEncoding::LegacyV1);
        assert_eq!(
            RawEncoding::classify(&json!({"items": {}, "schedule": {}})),
            RawEncoding::UnversionedV2
        );
        assert_eq!(
            RawEncoding::classify(&json!({"items": {"a": {"id": "a"}}})),
            RawEncoding::UnversionedV2
        );
        assert_eq!(RawEncoding::classify(&json!({"items": 3})), RawEncoding::Unrecognized);
    }

    #[test]
    fn detect_version_ignores_non_numeric_version() {
        assert_eq!(detect_version(&json!({"version": "2", "items": {}, "schedule": {}})), Some(2));
        assert_eq!(detect_version(&json!({"version": "2"})), None);
        assert_eq!(detect_version(&json!({"version": 2})), Some(2));
    }

    #[test]
    fn run_migrations_identity() {
        let registry = MigrationRegistry::standard();
        let data = json!({"anything": [1, 2, 3]});
        assert_eq!(registry.run_migrations(data.clone(), 2, 2).unwrap(), data);
    }

    #[test]
    fn run_migrations_composes_steps_in_order() {
        let registry = MigrationRegistry::empty(3)
            .with_step(1, migrate_legacy_to_current)
            .with_step(2, bump_to_v3);
        let legacy = json!({
            "tabCount": 1,
            "5000": [{"id": "t1", "url": "https://example.com", "creationTime": 10}]
        });

        let composed = registry.run_migrations(legacy.clone(), 1, 3).unwrap();
        let stepwise = bump_to_v3(migrate_legacy_to_current(legacy).unwrap()).unwrap();
        assert_eq!(composed, stepwise);
        assert_eq!(composed["version"], 3);
        assert_eq!(composed["items"]["t1"]["popTime"], 5000);
    }

    #[test]
    fn missing_step_is_a_gap_error() {
        let registry = MigrationRegistry::standard();
        let err = registry.run_migrations(json!({}), 2, 3).unwrap_err();
        assert_eq!(err, MigrationError::Gap { version: 2 });

        let registry = MigrationRegistry::empty(3).with_step(2, bump_to_v3);
        let err = registry.run_migrations(json!({}), 1, 3).unwrap_err();
        assert_eq!(err, MigrationError::Gap { version: 1 });
    }

    #[test]
    fn newer_version_is_unsupported() {
        let registry = MigrationRegistry::standard();
        let err = registry.upgrade(json!({"version": 9, "items": {}, "schedule": {}})).unwrap_err();
        assert_eq!(err, MigrationError::Unsupported { found: 9, latest: 2 });
    }

    #[test]
    fn upgrade_stamps_version_on_unversioned_v2() {
        let registry = MigrationRegistry::standard();
        let (upgraded, encoding) = registry
            .upgrade(json!({"items": {}, "schedule": {}}))
            .unwrap();
        assert_eq!(encoding, RawEncoding::UnversionedV2);
        assert_eq!(upgraded["version"], 2);

        assert_eq!(
            registry.upgrade(json!({"nothing": true})).unwrap_err(),
            MigrationError::Unrecognized
        );
    }

    #[test]
    fn legacy_migration_converts_buckets() {
        let legacy = json!({
            "tabCount": 3,
            "2000": [
                {"id": "keep", "url": "https://a.example", "title": "A", "favicon": "https://a.example/f.ico",
                 "creationTime": 50, "groupId": "w1", "index": 1},
                {"url": "https://b.example", "popTime": 2500}
            ],
            "notatime": [{"url": "https://c.example"}],
            "3000": "not an array"
        });

        let migrated = migrate_legacy_to_current(legacy).unwrap();
        let container: StorageContainer = serde_json::from_value(migrated).unwrap();

        assert_eq!(container.version, 2);
        assert_eq!(container.len(), 2);
        assert!(container.is_consistent());

        let keep = &container.items["keep"];
        assert_eq!(keep.pop_time, 2000);
        assert_eq!(keep.creation_time, 50);
        assert_eq!(keep.title.as_deref(), Some("A"));
        assert_eq!(keep.group_id.as_deref(), Some("w1"));
        assert_eq!(keep.index, Some(1));

        let generated = container
            .items
            .values()
            .find(|i| i.url == "https://b.example")
            .expect("entry without id gets a generated one");
        assert_eq!(generated.pop_time, 2500);
        assert!(!generated.id.is_empty());
        assert!(generated.creation_time > 0);
    }

    #[test]
    fn legacy_migration_skips_unrestorable_urls() {
        let legacy = json!({
            "tabCount": 2,
            "1000": [
                {"url": "chrome://settings", "creationTime": 1},
                {"url": "https://ok.example", "creationTime": 1},
                {"url": "", "creationTime": 1}
            ]
        });
        let migrated = migrate_legacy_to_current(legacy).unwrap();
        assert_eq!(migrated["items"].as_object().unwrap().len(), 1);
    }

    #[test]
    fn legacy_migration_regenerates_colliding_ids() {
        let legacy = json!({
            "1000": [
                {"id": "dup", "url": "https://one.example"},
                {"id": "dup", "url": "https://two.example"}
            ]
        });
        let migrated = migrate_legacy_to_current(legacy).unwrap();
        let container: StorageContainer = serde_json::from_value(migrated).unwrap();
        assert_eq!(container.len(), 2);
        assert!(container.items.contains_key("dup"));
        assert!(container.is_consistent());
    }
}
