// ABOUTME: Structural validation and best-effort repair of raw (untrusted) container JSON.
// ABOUTME: Validators report every problem found; sanitize never fails and always yields a consistent container.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::{Item, StorageContainer};

/// A structural violation in an item or container. Recoverable via `sanitize`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("structural validation failed: {}", .problems.join("; "))]
pub struct ValidationError {
    pub problems: Vec<String>,
}

impl ValidationError {
    fn from_problems(problems: Vec<String>) -> Result<(), Self> {
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Self { problems })
        }
    }
}

/// Check the required fields of a single raw item:
/// `url` (string), `creationTime` (number), `popTime` (number).
/// Optional fields are not type-checked.
pub fn validate_item(raw: &Value) -> Result<(), ValidationError> {
    ValidationError::from_problems(item_problems(raw))
}

fn item_problems(raw: &Value) -> Vec<String> {
    let Some(obj) = raw.as_object() else {
        return vec!["item is not an object".to_string()];
    };

    let mut problems = Vec::new();
    match obj.get("url") {
        Some(Value::String(_)) => {}
        Some(_) => problems.push("url is not a string".to_string()),
        None => problems.push("url is missing".to_string()),
    }
    for field in ["creationTime", "popTime"] {
        match obj.get(field) {
            Some(Value::Number(_)) => {}
            Some(_) => problems.push(format!("{} is not a number", field)),
            None => problems.push(format!("{} is missing", field)),
        }
    }
    problems
}

/// The item's own `id` field, if it is a string equal to its map key.
fn id_matches_key(key: &str, raw: &Value) -> bool {
    raw.get("id").and_then(Value::as_str) == Some(key)
}

/// Check a raw container: `items` and `schedule` must be maps, every item
/// must validate and be stored under its own id, and every schedule bucket
/// must be an array of ids that resolve in `items`.
pub fn validate_container(raw: &Value) -> Result<(), ValidationError> {
    let mut problems = Vec::new();

    let items = match raw.get("items") {
        Some(Value::Object(items)) => Some(items),
        _ => {
            problems.push("items is not a map".to_string());
            None
        }
    };

    if let Some(items) = items {
        for (key, item) in items {
            for problem in item_problems(item) {
                problems.push(format!("item {}: {}", key, problem));
            }
            if !id_matches_key(key, item) {
                problems.push(format!("item {}: id does not match its key", key));
            }
        }
    }

    match raw.get("schedule") {
        Some(Value::Object(schedule)) => {
            for (time, bucket) in schedule {
                let Some(ids) = bucket.as_array() else {
                    problems.push(format!("schedule {}: bucket is not an array", time));
                    continue;
                };
                for id in ids {
                    let resolves = id
                        .as_str()
                        .zip(items)
                        .is_some_and(|(id, items)| items.contains_key(id));
                    if !resolves {
                        problems.push(format!("schedule {}: dangling id {}", time, id));
                    }
                }
            }
        }
        _ => problems.push("schedule is not a map".to_string()),
    }

    ValidationError::from_problems(problems)
}

/// Repair a raw container by keeping only items that validate and are
/// stored under their own id, then rebuilding the schedule from the
/// surviving items' pop times. Never fails; non-object input yields an
/// empty container. Idempotent.
pub fn sanitize(raw: &Value) -> StorageContainer {
    let mut container = StorageContainer::empty();

    let empty = Map::new();
    let items = raw
        .as_object()
        .and_then(|obj| obj.get("items"))
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let mut dropped = 0usize;
    for (key, item) in items {
        if !item_problems(item).is_empty() || !id_matches_key(key, item) {
            dropped += 1;
            continue;
        }
        match Item::from_raw(item) {
            Some(item) => container.insert_item(item),
            None => dropped += 1,
        }
    }

    if dropped > 0 {
        tracing::debug!(
            "sanitize dropped {} malformed item(s), kept {}",
            dropped,
            container.len()
        );
    }

    container
}
