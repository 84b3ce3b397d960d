//! Bidirectional watch-handle <-> directory bookkeeping.
//!
//! The registry owns every handle issued by its [`EventSource`]. Both
//! directions live under one lock so a reader never observes a handle
//! without its path or the reverse.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use walkdir::WalkDir;

use super::error::{MonitorError, MonitorResult};
use super::source::{EventSource, WatchHandle};

#[derive(Debug, Default)]
struct Entries {
    by_handle: HashMap<WatchHandle, PathBuf>,
    by_dir: HashMap<PathBuf, WatchHandle>,
    /// Directories that were watched and have since been invalidated.
    retired: HashSet<PathBuf>,
}

/// Outcome of [`WatchRegistry::register_tree`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeRegistration {
    /// Directories now watched (newly or already).
    pub registered: usize,
    /// Directories skipped because they vanished or were rejected.
    pub skipped: usize,
}

/// Registry of live watch handles and the directories they represent.
pub struct WatchRegistry {
    source: Arc<dyn EventSource>,
    entries: RwLock<Entries>,
    closed: AtomicBool,
}

impl WatchRegistry {
    pub fn new(source: Arc<dyn EventSource>) -> Self {
        Self {
            source,
            entries: RwLock::new(Entries::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// The source this registry issues handles from.
    pub fn source(&self) -> &Arc<dyn EventSource> {
        &self.source
    }

    /// Register exactly `dir`. Already registered directories return their
    /// existing handle.
    ///
    /// The entry lock is held across the source call, so a worker resolving
    /// an early batch for the new handle waits for the entry instead of
    /// seeing an unknown handle.
    pub fn register_directory(&self, dir: &Path) -> MonitorResult<WatchHandle> {
        let mut entries = self.entries.write();
        if self.closed.load(Ordering::Acquire) {
            return Err(MonitorError::registration(dir, "registry shut down"));
        }
        if let Some(handle) = entries.by_dir.get(dir) {
            return Ok(*handle);
        }

        let handle = self.source.watch(dir)?;

        entries.by_dir.insert(dir.to_path_buf(), handle);
        entries.by_handle.insert(handle, dir.to_path_buf());
        entries.retired.remove(dir);
        drop(entries);

        crate::debug_event!("registry", "watching", "{} {handle}", dir.display());
        Ok(handle)
    }

    /// Register `root` and every directory below it, pre-order.
    ///
    /// Symlinks are not followed. A subdirectory that disappears or is
    /// rejected is skipped together with its subtree; only a failure on
    /// `root` itself is returned.
    pub fn register_tree(&self, root: &Path) -> MonitorResult<TreeRegistration> {
        let mut summary = TreeRegistration::default();
        let mut walker = WalkDir::new(root).follow_links(false).into_iter();

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if e.depth() == 0 {
                        return Err(MonitorError::registration(root, e));
                    }
                    crate::debug_event!("registry", "walk skipped", "{e}");
                    summary.skipped += 1;
                    continue;
                }
            };

            if !entry.file_type().is_dir() {
                if entry.depth() == 0 {
                    return Err(MonitorError::registration(root, "not a directory"));
                }
                continue;
            }

            match self.register_directory(entry.path()) {
                Ok(_) => summary.registered += 1,
                Err(e) if entry.depth() == 0 => return Err(e),
                Err(e) => {
                    crate::warn_event!("registry", "skipping subtree", "{e}");
                    summary.skipped += 1;
                    walker.skip_current_dir();
                }
            }
        }

        crate::log_event!(
            "registry",
            "tree registered",
            "{} ({} directories, {} skipped)",
            root.display(),
            summary.registered,
            summary.skipped
        );
        Ok(summary)
    }

    /// Directory for a live handle.
    pub fn resolve(&self, handle: WatchHandle) -> MonitorResult<PathBuf> {
        self.entries
            .read()
            .by_handle
            .get(&handle)
            .cloned()
            .ok_or(MonitorError::UnknownHandle(handle))
    }

    /// Drop the entry for `handle` and release it in the source.
    ///
    /// Returns true if nothing is left to watch.
    pub fn invalidate(&self, handle: WatchHandle) -> bool {
        let mut entries = self.entries.write();
        if let Some(dir) = entries.by_handle.remove(&handle) {
            entries.by_dir.remove(&dir);
            crate::debug_event!("registry", "invalidated", "{} {handle}", dir.display());
            entries.retired.insert(dir);
        }
        let empty = entries.by_handle.is_empty();
        drop(entries);

        self.source.unwatch(handle);
        empty
    }

    /// Close the source and forget every handle. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.source.close();
        let mut entries = self.entries.write();
        entries.by_handle.clear();
        entries.by_dir.clear();
        entries.retired.clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn handle_for(&self, dir: &Path) -> Option<WatchHandle> {
        self.entries.read().by_dir.get(dir).copied()
    }

    pub fn contains_directory(&self, dir: &Path) -> bool {
        self.entries.read().by_dir.contains_key(dir)
    }

    /// True if `path` is watched now or was a watched directory that has
    /// since gone away.
    pub fn is_known_directory(&self, path: &Path) -> bool {
        let entries = self.entries.read();
        entries.by_dir.contains_key(path) || entries.retired.contains(path)
    }

    /// Forget that `path` was a directory; something else now lives there.
    pub fn forget_retired(&self, path: &Path) {
        let mut entries = self.entries.write();
        entries.retired.remove(path);
    }

    /// Watched directories, sorted.
    pub fn directories(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.entries.read().by_dir.keys().cloned().collect();
        dirs.sort();
        dirs
    }

    pub fn len(&self) -> usize {
        self.entries.read().by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().by_handle.is_empty()
    }
}

impl std::fmt::Debug for WatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchRegistry")
            .field("directories", &self.len())
            .field("closed", &self.is_shut_down())
            .finish()
    }
}
