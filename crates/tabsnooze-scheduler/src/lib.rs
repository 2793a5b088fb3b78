// ABOUTME: Restoration side of tabsnooze: finds due items, reopens them, and reschedules failures.
// ABOUTME: The restoration surface and connectivity check are traits so hosts and tests can plug in.

pub mod config;
pub mod scheduler;
pub mod surface;
pub mod testing;

pub use config::SchedulerConfig;
pub use scheduler::{
    PassOutcome, PassState, RESTORE_FAILED_NOTIFICATION_ID, RestorationScheduler, SchedulerError,
    SkipReason,
};
pub use surface::{
    AlwaysOnline, ConnectivityProbe, EntryHandle, RestorationSurface, SurfaceError, SurfaceHandle,
};
