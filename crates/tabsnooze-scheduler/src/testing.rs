// ABOUTME: Test doubles for the scheduler's host capabilities: a scripted surface and a toggleable probe.
// ABOUTME: Used in tests to simulate failing or partial restores without a real browser.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::surface::{ConnectivityProbe, EntryHandle, RestorationSurface, SurfaceError, SurfaceHandle};

#[derive(Debug, Default)]
struct ScriptState {
    next_id: u64,
    surfaces: BTreeMap<String, Vec<EntryHandle>>,
    last_focused: Option<String>,
    closed: Vec<String>,
    add_attempts: BTreeMap<String, usize>,
    transient_failures: usize,
}

impl ScriptState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn take_transient_failure(&mut self) -> Result<(), SurfaceError> {
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(SurfaceError::Call("scripted transient failure".to_string()));
        }
        Ok(())
    }

    fn handle(&self, surface_id: &str) -> Result<SurfaceHandle, SurfaceError> {
        let entries = self
            .surfaces
            .get(surface_id)
            .ok_or_else(|| SurfaceError::UnknownSurface(surface_id.to_string()))?;
        Ok(SurfaceHandle {
            id: surface_id.to_string(),
            entries: entries.clone(),
        })
    }
}

/// An in-memory restoration surface with scriptable failures.
///
/// URLs registered with `fail_url` never open: adding them errors, and a
/// new surface seeded with them comes back missing those entries.
#[derive(Debug, Default)]
pub struct ScriptedSurface {
    state: Mutex<ScriptState>,
    failing_urls: HashSet<String>,
    delay: Option<Duration>,
}

impl ScriptedSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with one empty, focused surface.
    pub fn with_focused_surface(mut self) -> Self {
        let state = self.state.get_mut();
        let id = state.next_id("surface");
        state.surfaces.insert(id.clone(), Vec::new());
        state.last_focused = Some(id);
        self
    }

    pub fn fail_url(mut self, url: &str) -> Self {
        self.failing_urls.insert(url.to_string());
        self
    }

    /// Fail the next `count` calls of any kind.
    pub fn fail_next(mut self, count: usize) -> Self {
        self.state.get_mut().transient_failures = count;
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// URLs in every open surface, in surface then entry order.
    pub async fn open_urls(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .surfaces
            .values()
            .flat_map(|entries| entries.iter().map(|e| e.url.clone()))
            .collect()
    }

    pub async fn closed_surfaces(&self) -> Vec<String> {
        self.state.lock().await.closed.clone()
    }

    /// How many times `add_entry` was called for `url`.
    pub async fn add_attempts(&self, url: &str) -> usize {
        self.state
            .lock()
            .await
            .add_attempts
            .get(url)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl RestorationSurface for ScriptedSurface {
    async fn create_surface(
        &self,
        urls: &[String],
        focus: bool,
    ) -> Result<SurfaceHandle, SurfaceError> {
        self.pause().await;
        let mut state = self.state.lock().await;
        state.take_transient_failure()?;

        let id = state.next_id("surface");
        let mut entries = Vec::new();
        for url in urls.iter().filter(|url| !self.failing_urls.contains(*url)) {
            entries.push(EntryHandle {
                id: state.next_id("entry"),
                url: url.clone(),
            });
        }
        state.surfaces.insert(id.clone(), entries);
        if focus {
            state.last_focused = Some(id.clone());
        }
        state.handle(&id)
    }

    async fn refresh_surface(&self, surface_id: &str) -> Result<SurfaceHandle, SurfaceError> {
        self.pause().await;
        let mut state = self.state.lock().await;
        state.take_transient_failure()?;
        state.handle(surface_id)
    }

    async fn close_surface(&self, surface_id: &str) -> Result<(), SurfaceError> {
        self.pause().await;
        let mut state = self.state.lock().await;
        state.take_transient_failure()?;
        if state.surfaces.remove(surface_id).is_none() {
            return Err(SurfaceError::UnknownSurface(surface_id.to_string()));
        }
        if state.last_focused.as_deref() == Some(surface_id) {
            state.last_focused = None;
        }
        state.closed.push(surface_id.to_string());
        Ok(())
    }

    async fn last_focused_surface(&self) -> Result<Option<SurfaceHandle>, SurfaceError> {
        self.pause().await;
        let mut state = self.state.lock().await;
        state.take_transient_failure()?;
        match state.last_focused.clone() {
            Some(id) => state.handle(&id).map(Some),
            None => Ok(None),
        }
    }

    async fn add_entry(&self, surface_id: &str, url: &str) -> Result<(), SurfaceError> {
        self.pause().await;
        let mut state = self.state.lock().await;
        *state.add_attempts.entry(url.to_string()).or_default() += 1;
        state.take_transient_failure()?;
        if self.failing_urls.contains(url) {
            return Err(SurfaceError::Call(format!("scripted failure for {}", url)));
        }

        let entry = EntryHandle {
            id: state.next_id("entry"),
            url: url.to_string(),
        };
        state
            .surfaces
            .get_mut(surface_id)
            .ok_or_else(|| SurfaceError::UnknownSurface(surface_id.to_string()))?
            .push(entry);
        Ok(())
    }

    async fn close_entry(&self, entry_id: &str) -> Result<(), SurfaceError> {
        self.pause().await;
        let mut state = self.state.lock().await;
        state.take_transient_failure()?;
        for entries in state.surfaces.values_mut() {
            if let Some(pos) = entries.iter().position(|e| e.id == entry_id) {
                entries.remove(pos);
                return Ok(());
            }
        }
        Err(SurfaceError::Call(format!("unknown entry {}", entry_id)))
    }
}

/// A connectivity probe whose answer can be flipped at runtime.
#[derive(Debug)]
pub struct ToggleConnectivity {
    online: AtomicBool,
}

impl ToggleConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivityProbe for ToggleConnectivity {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failing_urls_produce_partial_surfaces() {
        let surface = ScriptedSurface::new().fail_url("https://bad.example");
        let urls = vec!["https://ok.example".to_string(), "https://bad.example".to_string()];

        let handle = surface.create_surface(&urls, true).await.unwrap();
        assert_eq!(handle.entries.len(), 1);
        assert!(surface.add_entry(&handle.id, "https://bad.example").await.is_err());
        assert_eq!(surface.add_attempts("https://bad.example").await, 1);
    }

    #[tokio::test]
    async fn close_entry_and_surface() {
        let surface = ScriptedSurface::new().with_focused_surface();
        let focused = surface.last_focused_surface().await.unwrap().unwrap();
        surface.add_entry(&focused.id, "https://a.example").await.unwrap();

        let entry = surface.refresh_surface(&focused.id).await.unwrap().entries[0].clone();
        surface.close_entry(&entry.id).await.unwrap();
        assert!(surface.open_urls().await.is_empty());

        surface.close_surface(&focused.id).await.unwrap();
        assert!(surface.last_focused_surface().await.unwrap().is_none());
        assert_eq!(surface.closed_surfaces().await, vec![focused.id]);
    }

    #[tokio::test]
    async fn transient_failures_run_out() {
        let surface = ScriptedSurface::new().fail_next(1);
        assert!(surface.last_focused_surface().await.is_err());
        assert!(surface.last_focused_surface().await.is_ok());
    }

    #[tokio::test]
    async fn toggle_connectivity() {
        let probe = ToggleConnectivity::new(true);
        assert!(probe.is_online().await);
        probe.set_online(false);
        assert!(!probe.is_online().await);
    }
}
