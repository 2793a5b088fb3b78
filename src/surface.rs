// ABOUTME: Headless restoration surface that "opens" tabs by printing them as JSON lines on stdout.
// ABOUTME: Lets the CLI run restoration passes without a browser attached.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use tabsnooze_scheduler::{EntryHandle, RestorationSurface, SurfaceError, SurfaceHandle};
use tokio::sync::Mutex;

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum SurfaceEvent<'a> {
    OpenSurface { surface: &'a str },
    OpenEntry { surface: &'a str, entry: &'a str, url: &'a str },
    CloseSurface { surface: &'a str },
    CloseEntry { entry: &'a str },
}

fn emit(event: &SurfaceEvent<'_>) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::error!("could not encode surface event: {}", e),
    }
}

#[derive(Debug, Default)]
struct Surfaces {
    next_id: u64,
    open: BTreeMap<String, Vec<EntryHandle>>,
    focused: Option<String>,
}

impl Surfaces {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn open_entry(&mut self, surface_id: &str, url: &str) -> Result<(), SurfaceError> {
        let entry = EntryHandle {
            id: self.next_id("entry"),
            url: url.to_string(),
        };
        emit(&SurfaceEvent::OpenEntry {
            surface: surface_id,
            entry: &entry.id,
            url,
        });
        self.open
            .get_mut(surface_id)
            .ok_or_else(|| SurfaceError::UnknownSurface(surface_id.to_string()))?
            .push(entry);
        Ok(())
    }

    fn handle(&self, surface_id: &str) -> Result<SurfaceHandle, SurfaceError> {
        self.open
            .get(surface_id)
            .map(|entries| SurfaceHandle {
                id: surface_id.to_string(),
                entries: entries.clone(),
            })
            .ok_or_else(|| SurfaceError::UnknownSurface(surface_id.to_string()))
    }
}

/// Restoration surface for headless runs.
#[derive(Debug, Default)]
pub struct StdoutSurface {
    surfaces: Mutex<Surfaces>,
}

impl StdoutSurface {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RestorationSurface for StdoutSurface {
    async fn create_surface(
        &self,
        urls: &[String],
        focus: bool,
    ) -> Result<SurfaceHandle, SurfaceError> {
        let mut surfaces = self.surfaces.lock().await;
        let id = surfaces.next_id("surface");
        emit(&SurfaceEvent::OpenSurface { surface: &id });
        surfaces.open.insert(id.clone(), Vec::new());
        for url in urls {
            surfaces.open_entry(&id, url)?;
        }
        if focus {
            surfaces.focused = Some(id.clone());
        }
        surfaces.handle(&id)
    }

    async fn refresh_surface(&self, surface_id: &str) -> Result<SurfaceHandle, SurfaceError> {
        self.surfaces.lock().await.handle(surface_id)
    }

    async fn close_surface(&self, surface_id: &str) -> Result<(), SurfaceError> {
        let mut surfaces = self.surfaces.lock().await;
        if surfaces.open.remove(surface_id).is_none() {
            return Err(SurfaceError::UnknownSurface(surface_id.to_string()));
        }
        if surfaces.focused.as_deref() == Some(surface_id) {
            surfaces.focused = None;
        }
        emit(&SurfaceEvent::CloseSurface {
            surface: surface_id,
        });
        Ok(())
    }

    async fn last_focused_surface(&self) -> Result<Option<SurfaceHandle>, SurfaceError> {
        let surfaces = self.surfaces.lock().await;
        match &surfaces.focused {
            Some(id) => surfaces.handle(id).map(Some),
            None => Ok(None),
        }
    }

    async fn add_entry(&self, surface_id: &str, url: &str) -> Result<(), SurfaceError> {
        self.surfaces.lock().await.open_entry(surface_id, url)
    }

    async fn close_entry(&self, entry_id: &str) -> Result<(), SurfaceError> {
        let mut surfaces = self.surfaces.lock().await;
        for entries in surfaces.open.values_mut() {
            if let Some(pos) = entries.iter().position(|e| e.id == entry_id) {
                entries.remove(pos);
                emit(&SurfaceEvent::CloseEntry { entry: entry_id });
                return Ok(());
            }
        }
        Err(SurfaceError::Call(format!("unknown entry {}", entry_id)))
    }
}
