// ABOUTME: Defines the persisted data model: snoozed items, the time-bucketed schedule, and the container.
// ABOUTME: All container mutations keep the schedule and item map consistent with each other.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Schema version written by this build.
pub const CURRENT_VERSION: u32 = 2;

/// Current wall-clock time as epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate a fresh, globally unique item id.
pub fn new_item_id() -> String {
    Ulid::new().to_string()
}

/// A single snoozed tab waiting to be reopened at `pop_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
    pub creation_time: i64,
    pub pop_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<i64>,
}

impl Item {
    /// Create an item due at `pop_time`, stamped with the current time.
    pub fn new(id: String, url: String, pop_time: i64) -> Self {
        Self {
            id,
            url,
            title: None,
            favicon: None,
            creation_time: now_millis(),
            pop_time,
            group_id: None,
            index: None,
        }
    }

    /// Build an item from a raw JSON object that has already passed
    /// `validate_item`. Optional fields of the wrong type are dropped.
    pub fn from_raw(raw: &serde_json::Value) -> Option<Self> {
        let obj = raw.as_object()?;
        Some(Self {
            id: obj.get("id")?.as_str()?.to_string(),
            url: obj.get("url")?.as_str()?.to_string(),
            title: obj.get("title").and_then(|v| v.as_str()).map(str::to_string),
            favicon: obj.get("favicon").and_then(|v| v.as_str()).map(str::to_string),
            creation_time: millis_from_value(obj.get("creationTime")?)?,
            pop_time: millis_from_value(obj.get("popTime")?)?,
            group_id: obj.get("groupId").and_then(|v| v.as_str()).map(str::to_string),
            index: obj.get("index").and_then(millis_from_value),
        })
    }

    /// The schedule bucket key this item belongs to.
    pub fn time_key(&self) -> String {
        self.pop_time.to_string()
    }

    /// The summary cached for inspection when a restore fails.
    pub fn summary(&self) -> FailedItemSummary {
        FailedItemSummary {
            id: self.id.clone(),
            url: self.url.clone(),
            title: self.title.clone(),
            favicon: self.favicon.clone(),
        }
    }
}

/// Read a JSON number as integral milliseconds, truncating fractions.
pub(crate) fn millis_from_value(value: &serde_json::Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
}

/// Details of an item whose restore failed, kept for later inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedItemSummary {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub favicon: Option<String>,
}

/// The whole persisted store: every item keyed by id, plus a schedule
/// mapping each due time (epoch ms, string-encoded) to the ids due then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageContainer {
    pub version: u32,
    #[serde(default)]
    pub items: BTreeMap<String, Item>,
    #[serde(default)]
    pub schedule: BTreeMap<String, Vec<String>>,
}

impl Default for StorageContainer {
    fn default() -> Self {
        Self::empty()
    }
}

impl StorageContainer {
    /// An empty container at the current schema version.
    pub fn empty() -> Self {
        Self {
            version: CURRENT_VERSION,
            items: BTreeMap::new(),
            schedule: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn to_value(&self) -> serde_json::Value {
        // A struct of strings, integers and maps always serializes.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Insert an item and register its id under its pop-time bucket.
    /// An existing item with the same id is replaced and unscheduled first.
    pub fn insert_item(&mut self, item: Item) {
        if self.items.contains_key(&item.id) {
            self.remove_item(&item.id.clone());
        }
        self.schedule
            .entry(item.time_key())
            .or_default()
            .push(item.id.clone());
        self.items.insert(item.id.clone(), item);
    }

    /// Remove an item and drop its id from every schedule bucket, pruning
    /// buckets left empty.
    pub fn remove_item(&mut self, id: &str) -> Option<Item> {
        let removed = self.items.remove(id);
        self.unschedule(id);
        removed
    }

    /// Move an item to a new due time. Returns false if the item is gone.
    pub fn reschedule(&mut self, id: &str, pop_time: i64) -> bool {
        let Some(item) = self.items.get_mut(id) else {
            return false;
        };
        item.pop_time = pop_time;
        let key = item.time_key();
        self.unschedule(id);
        self.schedule.entry(key).or_default().push(id.to_string());
        true
    }

    fn unschedule(&mut self, id: &str) {
        self.schedule.retain(|_, ids| {
            ids.retain(|existing| existing != id);
            !ids.is_empty()
        });
    }

    /// Ids of all items in the given group.
    pub fn group_members(&self, group_id: &str) -> Vec<String> {
        self.items
            .values()
            .filter(|item| item.group_id.as_deref() == Some(group_id))
            .map(|item| item.id.clone())
            .collect()
    }

    /// Items whose schedule key is strictly earlier than `now`, in ascending
    /// time order. Ids with no matching item are skipped.
    pub fn due_items(&self, now: i64) -> Vec<&Item> {
        let mut buckets: Vec<(i64, &Vec<String>)> = self
            .schedule
            .iter()
            .filter_map(|(key, ids)| key.parse::<i64>().ok().map(|time| (time, ids)))
            .filter(|(time, _)| *time < now)
            .collect();
        buckets.sort_by_key(|(time, _)| *time);

        buckets
            .into_iter()
            .flat_map(|(_, ids)| ids.iter())
            .filter_map(|id| self.items.get(id))
            .collect()
    }

    /// Generate an id not already present in this container.
    pub fn fresh_id(&self) -> String {
        loop {
            let id = new_item_id();
            if !self.items.contains_key(&id) {
                return id;
            }
        }
    }

    /// True when every scheduled id resolves and every item sits in its own
    /// pop-time bucket.
    pub fn is_consistent(&self) -> bool {
        let dangling = self
            .schedule
            .values()
            .flatten()
            .any(|id| !self.items.contains_key(id));
        let unscheduled = self.items.values().any(|item| {
            self.schedule
                .get(&item.time_key())
                .is_none_or(|ids| !ids.contains(&item.id))
        });
        let aliased = self.items.iter().any(|(key, item)| key != &item.id);
        !dangling && !unscheduled && !aliased
    }
}
