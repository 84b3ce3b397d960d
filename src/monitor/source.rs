//! The event-source seam between the monitor and the OS watch facility.

use std::fmt;
use std::path::{Path, PathBuf};

use super::error::MonitorResult;

/// Opaque token for one watched directory, issued by an [`EventSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(u64);

impl WatchHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single low-level event. Paths are relative to the directory owning the
/// batch handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    /// The source knows the entry is a directory. Never dispatched.
    DirectoryCreated(PathBuf),
    DirectoryDeleted(PathBuf),
    /// Events were dropped by the source; nothing to resolve.
    Overflow,
}

/// Events delivered together for one watch handle.
///
/// `handle` is `None` only for overflow notices the source could not
/// attribute to a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch {
    pub handle: Option<WatchHandle>,
    pub events: Vec<RawEvent>,
}

impl EventBatch {
    pub fn new(handle: WatchHandle, events: Vec<RawEvent>) -> Self {
        Self {
            handle: Some(handle),
            events,
        }
    }

    /// An unattributed overflow notice.
    pub fn overflow() -> Self {
        Self {
            handle: None,
            events: vec![RawEvent::Overflow],
        }
    }
}

/// Blocking, per-directory watch facility consumed by the monitor.
///
/// Implementations must be safe to share between the worker blocked in
/// [`EventSource::next_batch`] and configuration threads calling
/// [`EventSource::watch`]. [`EventSource::close`] must wake any pending
/// `next_batch` call.
pub trait EventSource: Send + Sync {
    /// Start watching exactly `dir` (not its children).
    ///
    /// Fails with [`super::MonitorError::Registration`] if the directory is
    /// missing or inaccessible.
    fn watch(&self, dir: &Path) -> MonitorResult<WatchHandle>;

    /// Stop watching a handle. Unknown handles are ignored.
    fn unwatch(&self, handle: WatchHandle);

    /// Block until the next batch arrives. Returns `None` once closed.
    fn next_batch(&self) -> Option<EventBatch>;

    /// Whether `handle` still refers to a watchable directory.
    fn is_valid(&self, handle: WatchHandle) -> bool;

    /// Release OS resources and unblock waiters. Idempotent.
    fn close(&self);
}
