// ABOUTME: Traits for the host capabilities the scheduler drives: the restoration surface and connectivity.
// ABOUTME: A surface is a window-like container of entries; errors from it are transient and retried.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single call against the restoration surface failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SurfaceError {
    #[error("surface call failed: {0}")]
    Call(String),

    #[error("unknown surface: {0}")]
    UnknownSurface(String),

    #[error("surface opened {opened} of {expected} entries")]
    Incomplete { expected: usize, opened: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHandle {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceHandle {
    pub id: String,
    pub entries: Vec<EntryHandle>,
}

/// The host capability that can open and close windows and tabs.
#[async_trait]
pub trait RestorationSurface: Send + Sync {
    /// Open a new surface pre-seeded with `urls`, in order.
    async fn create_surface(&self, urls: &[String], focus: bool)
    -> Result<SurfaceHandle, SurfaceError>;

    /// Current state of an existing surface.
    async fn refresh_surface(&self, surface_id: &str) -> Result<SurfaceHandle, SurfaceError>;

    async fn close_surface(&self, surface_id: &str) -> Result<(), SurfaceError>;

    /// The surface the user last focused, if any is open.
    async fn last_focused_surface(&self) -> Result<Option<SurfaceHandle>, SurfaceError>;

    async fn add_entry(&self, surface_id: &str, url: &str) -> Result<(), SurfaceError>;

    async fn close_entry(&self, entry_id: &str) -> Result<(), SurfaceError>;
}

/// Reports whether the host currently has network connectivity.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// A probe for hosts that never go offline.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

#[async_trait]
impl ConnectivityProbe for AlwaysOnline {
    async fn is_online(&self) -> bool {
        true
    }
}
