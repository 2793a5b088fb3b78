// ABOUTME: Core library for tabsnooze, containing the persisted data model and pure store logic.
// ABOUTME: Defines items and containers, structural validation/sanitizing, and schema migrations.

pub mod migrate;
pub mod model;
pub mod restorable;
pub mod validate;

pub use migrate::{
    MigrationError, MigrationRegistry, RawEncoding, detect_version, migrate_legacy_to_current,
};
pub use model::{
    CURRENT_VERSION, FailedItemSummary, Item, StorageContainer, new_item_id, now_millis,
};
pub use restorable::is_restorable_url;
pub use validate::{ValidationError, sanitize, validate_container, validate_item};
