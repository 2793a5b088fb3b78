// ABOUTME: Transient cross-context signals kept in the session-scoped key-value service.
// ABOUTME: Every call is a no-op when the host offers no session storage.

use std::sync::Arc;

use serde_json::Value;
use tabsnooze_core::FailedItemSummary;

use crate::config::{FAILED_RESTORES_KEY, PENDING_RECOVERY_KEY};
use crate::kv::{BackendError, KeyValueStore, get_one, set_one};

/// Typed access to the session-scoped signals.
#[derive(Clone, Default)]
pub struct SessionSignals {
    service: Option<Arc<dyn KeyValueStore>>,
}

impl std::fmt::Debug for SessionSignals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSignals")
            .field("available", &self.service.is_some())
            .finish()
    }
}

impl SessionSignals {
    pub fn new(service: Option<Arc<dyn KeyValueStore>>) -> Self {
        Self { service }
    }

    /// Signals backed by no session service at all.
    pub fn absent() -> Self {
        Self { service: None }
    }

    pub fn is_available(&self) -> bool {
        self.service.is_some()
    }

    /// Record how many items the last recovery brought back.
    pub async fn set_pending_recovery(&self, count: usize) -> Result<(), BackendError> {
        let Some(service) = &self.service else {
            return Ok(());
        };
        set_one(service.as_ref(), PENDING_RECOVERY_KEY, Value::from(count)).await
    }

    pub async fn pending_recovery(&self) -> Result<Option<usize>, BackendError> {
        let Some(service) = &self.service else {
            return Ok(None);
        };
        let value = get_one(service.as_ref(), PENDING_RECOVERY_KEY).await?;
        Ok(value.and_then(|v| v.as_u64()).map(|v| v as usize))
    }

    pub async fn clear_pending_recovery(&self) -> Result<(), BackendError> {
        let Some(service) = &self.service else {
            return Ok(());
        };
        service.remove(&[PENDING_RECOVERY_KEY.to_string()]).await
    }

    /// Append summaries of items whose restore failed to the cached list.
    pub async fn append_failed_restores(
        &self,
        failed: &[FailedItemSummary],
    ) -> Result<(), BackendError> {
        let Some(service) = &self.service else {
            return Ok(());
        };
        let mut cached = self.failed_restores().await?;
        cached.extend_from_slice(failed);
        set_one(
            service.as_ref(),
            FAILED_RESTORES_KEY,
            serde_json::to_value(cached)?,
        )
        .await
    }

    /// Cached failure summaries. Unreadable cache contents count as empty.
    pub async fn failed_restores(&self) -> Result<Vec<FailedItemSummary>, BackendError> {
        let Some(service) = &self.service else {
            return Ok(Vec::new());
        };
        let cached = get_one(service.as_ref(), FAILED_RESTORES_KEY).await?;
        Ok(cached
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default())
    }

    pub async fn clear_failed_restores(&self) -> Result<(), BackendError> {
        let Some(service) = &self.service else {
            return Ok(());
        };
        service.remove(&[FAILED_RESTORES_KEY.to_string()]).await
    }
}
