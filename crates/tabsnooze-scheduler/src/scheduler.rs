// ABOUTME: RestorationScheduler runs passes that reopen due items through the restoration surface.
// ABOUTME: Failed items are rescheduled rather than dropped, cached for inspection, and reported once.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tabsnooze_core::{FailedItemSummary, Item, now_millis};
use tabsnooze_store::{Notification, StorageGateway, StoreError, notify_best_effort};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::surface::{AlwaysOnline, ConnectivityProbe, RestorationSurface, SurfaceError};

/// Notification id used when restores fail.
pub const RESTORE_FAILED_NOTIFICATION_ID: &str = "restore-failed";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("storage error during restoration pass: {0}")]
    Store(#[from] StoreError),
}

/// Whether a pass is currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Idle,
    Running,
}

/// Why a pass did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRunning,
    Offline,
}

/// Result of one scheduler pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PassOutcome {
    /// Items that were due this pass, regardless of how they ended.
    pub attempted: usize,
    pub restored: usize,
    pub failed: usize,
    pub skipped: Option<SkipReason>,
}

impl PassOutcome {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

/// Resets the pass state to idle when the pass ends, however it ends.
struct PassGuard<'a> {
    state: &'a Mutex<PassState>,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        match self.state.lock() {
            Ok(mut state) => *state = PassState::Idle,
            Err(poisoned) => *poisoned.into_inner() = PassState::Idle,
        }
    }
}

pub struct RestorationScheduler {
    gateway: Arc<StorageGateway>,
    surface: Arc<dyn RestorationSurface>,
    connectivity: Arc<dyn ConnectivityProbe>,
    config: SchedulerConfig,
    state: Mutex<PassState>,
}

impl RestorationScheduler {
    pub fn new(
        gateway: Arc<StorageGateway>,
        surface: Arc<dyn RestorationSurface>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            gateway,
            surface,
            connectivity: Arc::new(AlwaysOnline),
            config,
            state: Mutex::new(PassState::Idle),
        }
    }

    pub fn with_connectivity(mut self, connectivity: Arc<dyn ConnectivityProbe>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn state(&self) -> PassState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn try_begin(&self) -> Option<PassGuard<'_>> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state == PassState::Running {
            return None;
        }
        *state = PassState::Running;
        Some(PassGuard { state: &self.state })
    }

    /// Reopen every due item. Groups go into one new surface each; solo
    /// items are added to the last-focused surface. Successes are removed
    /// from storage, failures rescheduled `reschedule_delay` past the moment
    /// their retries ran out.
    pub async fn run_pass(&self) -> Result<PassOutcome, SchedulerError> {
        let Some(_guard) = self.try_begin() else {
            tracing::debug!("restoration pass already running, skipping");
            return Ok(PassOutcome::skipped(SkipReason::AlreadyRunning));
        };
        if !self.connectivity.is_online().await {
            tracing::info!("offline, skipping restoration pass");
            return Ok(PassOutcome::skipped(SkipReason::Offline));
        }

        let now = now_millis();
        let container = self.gateway.read().await?;
        let due: Vec<Item> = container.due_items(now).into_iter().cloned().collect();
        if due.is_empty() {
            return Ok(PassOutcome::default());
        }
        tracing::info!("{} item(s) due for restoration", due.len());

        let mut groups: BTreeMap<String, Vec<Item>> = BTreeMap::new();
        let mut solo = Vec::new();
        for item in due.iter().cloned() {
            match item.group_id.clone() {
                Some(group_id) => groups.entry(group_id).or_default().push(item),
                None => solo.push(item),
            }
        }

        let mut restored: Vec<String> = Vec::new();
        let mut failed: Vec<Item> = Vec::new();

        for (group_id, mut members) in groups {
            members.sort_by_key(|item| item.index.unwrap_or(i64::MAX));
            if self.restore_group(&group_id, &members).await {
                restored.extend(members.into_iter().map(|item| item.id));
            } else {
                failed.extend(members);
            }
        }

        if !solo.is_empty() {
            let (ok, bad) = self.restore_solo(solo).await;
            restored.extend(ok);
            failed.extend(bad);
        }

        // Removal and failure handling are independent; one failing must not
        // skip the other. The first error is returned once both have run.
        let mut first_error: Option<StoreError> = None;
        if !restored.is_empty() {
            if let Err(e) = self.gateway.remove_restored(&restored).await {
                tracing::error!("could not remove {} restored item(s): {}", restored.len(), e);
                first_error = Some(e);
            }
        }
        if !failed.is_empty() {
            if let Err(e) = self.handle_failures(&failed).await {
                first_error = first_error.or(Some(e));
            }
        }
        if let Some(e) = first_error {
            return Err(e.into());
        }

        let outcome = PassOutcome {
            attempted: due.len(),
            restored: restored.len(),
            failed: failed.len(),
            skipped: None,
        };
        tracing::info!(
            "restoration pass done: {} attempted, {} restored, {} failed",
            outcome.attempted,
            outcome.restored,
            outcome.failed
        );
        Ok(outcome)
    }

    /// Run `op` until it succeeds or the attempt bound is reached, sleeping
    /// `retry_delay` between attempts.
    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, SurfaceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SurfaceError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max_attempts => {
                    tracing::warn!("{} failed (attempt {}/{}): {}", what, attempt, max_attempts, e);
                    tokio::time::sleep(self.config.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!("{} failed after {} attempt(s): {}", what, attempt, e);
                    return Err(e);
                }
            }
        }
    }

    async fn restore_group(&self, group_id: &str, members: &[Item]) -> bool {
        let urls: Vec<String> = members.iter().map(|item| item.url.clone()).collect();
        let urls = urls.as_slice();
        let what = format!("restoring group {}", group_id);
        self.with_retries(&what, move || self.open_group(urls))
            .await
            .is_ok()
    }

    /// Open one surface holding every URL. A surface missing entries is
    /// closed again and counts as a failed attempt.
    async fn open_group(&self, urls: &[String]) -> Result<(), SurfaceError> {
        let created = self.surface.create_surface(urls, true).await?;
        let error = match self.surface.refresh_surface(&created.id).await {
            Ok(handle) if handle.entries.len() == urls.len() => return Ok(()),
            Ok(handle) => SurfaceError::Incomplete {
                expected: urls.len(),
                opened: handle.entries.len(),
            },
            Err(e) => e,
        };
        if let Err(e) = self.surface.close_surface(&created.id).await {
            tracing::warn!("could not close partial surface {}: {}", created.id, e);
        }
        Err(error)
    }

    /// Add each solo item to the target surface. One item exhausting its
    /// retries does not affect the others.
    async fn restore_solo(&self, items: Vec<Item>) -> (Vec<String>, Vec<Item>) {
        let target = self
            .with_retries("finding a target surface", move || self.target_surface())
            .await;
        let target = match target {
            Ok(target) => target,
            Err(_) => return (Vec::new(), items),
        };

        let mut restored = Vec::new();
        let mut failed = Vec::new();
        for item in items {
            let target = target.as_str();
            let url = item.url.as_str();
            let what = format!("restoring item {}", item.id);
            match self
                .with_retries(&what, move || self.surface.add_entry(target, url))
                .await
            {
                Ok(()) => restored.push(item.id),
                Err(_) => failed.push(item),
            }
        }
        (restored, failed)
    }

    async fn target_surface(&self) -> Result<String, SurfaceError> {
        if let Some(focused) = self.surface.last_focused_surface().await? {
            return Ok(focused.id);
        }
        Ok(self.surface.create_surface(&[], true).await?.id)
    }

    /// Reschedule failed items, cache their summaries, and raise one
    /// notification for the whole batch. The summaries are cached and the
    /// notification raised even when the reschedule write fails.
    async fn handle_failures(&self, failed: &[Item]) -> Result<(), StoreError> {
        let retry_at = now_millis().saturating_add(self.config.reschedule_delay_millis());
        let updates: Vec<(String, i64)> = failed
            .iter()
            .map(|item| (item.id.clone(), retry_at))
            .collect();
        let rescheduled = match self.gateway.reschedule(&updates).await {
            Ok(moved) => {
                tracing::warn!("rescheduled {} failed item(s) to {}", moved, retry_at);
                Ok(())
            }
            Err(e) => {
                tracing::error!("could not reschedule {} failed item(s): {}", failed.len(), e);
                Err(e)
            }
        };

        let summaries: Vec<FailedItemSummary> = failed.iter().map(Item::summary).collect();
        if let Err(e) = self.gateway.session().append_failed_restores(&summaries).await {
            tracing::warn!("could not cache failed restores: {}", e);
        }

        let message = if failed.len() == 1 {
            "1 snoozed tab could not be reopened and will be retried in a few minutes.".to_string()
        } else {
            format!(
                "{} snoozed tabs could not be reopened and will be retried in a few minutes.",
                failed.len()
            )
        };
        notify_best_effort(
            self.gateway.notifier().as_ref(),
            RESTORE_FAILED_NOTIFICATION_ID,
            Notification::basic("Some snoozed tabs failed to open", message),
        )
        .await;
        rescheduled
    }

    /// Run a pass every `tick_interval` until the handle is aborted. Pass
    /// errors are logged and the loop keeps going.
    pub fn spawn_periodic(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.tick_interval);
            loop {
                interval.tick().await;
                if let Err(e) = self.run_pass().await {
                    tracing::error!("restoration pass failed: {}", e);
                }
            }
        })
    }
}
