//! [`EventSource`] backed by `notify`, one non-recursive watch per directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;

use super::error::{MonitorError, MonitorResult};
use super::source::{EventBatch, EventSource, RawEvent, WatchHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Created,
    Modified,
    Deleted,
    DirectoryCreated,
    DirectoryDeleted,
}

impl Change {
    fn is_removal(self) -> bool {
        matches!(self, Change::Deleted | Change::DirectoryDeleted)
    }

    fn is_creation(self) -> bool {
        matches!(self, Change::Created | Change::DirectoryCreated)
    }

    fn into_raw(self, relative: PathBuf) -> RawEvent {
        match self {
            Change::Created => RawEvent::Created(relative),
            Change::Modified => RawEvent::Modified(relative),
            Change::Deleted => RawEvent::Deleted(relative),
            Change::DirectoryCreated => RawEvent::DirectoryCreated(relative),
            Change::DirectoryDeleted => RawEvent::DirectoryDeleted(relative),
        }
    }
}

/// Directory <-> handle routes, shared with the notify callback thread.
#[derive(Debug, Default)]
struct Routes {
    by_dir: DashMap<PathBuf, WatchHandle>,
    by_handle: DashMap<WatchHandle, PathBuf>,
}

impl Routes {
    fn handle_for(&self, dir: &Path) -> Option<WatchHandle> {
        self.by_dir.get(dir).map(|h| *h)
    }

    fn insert(&self, dir: PathBuf, handle: WatchHandle) {
        self.by_handle.insert(handle, dir.clone());
        self.by_dir.insert(dir, handle);
    }

    fn remove(&self, handle: WatchHandle) -> Option<PathBuf> {
        let (_, dir) = self.by_handle.remove(&handle)?;
        self.by_dir.remove_if(&dir, |_, h| *h == handle);
        Some(dir)
    }

    fn clear(&self) {
        self.by_dir.clear();
        self.by_handle.clear();
    }

    /// Split a notify event into per-handle batches.
    fn translate(&self, event: Event) -> Vec<EventBatch> {
        if event.need_rescan() {
            let handle = event.paths.first().and_then(|path| {
                self.handle_for(path)
                    .or_else(|| path.parent().and_then(|dir| self.handle_for(dir)))
            });
            return vec![match handle {
                Some(handle) => EventBatch::new(handle, vec![RawEvent::Overflow]),
                None => EventBatch::overflow(),
            }];
        }

        let mut batches: Vec<EventBatch> = Vec::new();
        for (path, change) in classify(&event) {
            // Events naming a watched directory itself never reach its
            // parent. A removal or rename only asks the loop to re-validate
            // the directory's own handle.
            if !change.is_creation() {
                if let Some(own) = self.handle_for(&path) {
                    if change.is_removal() {
                        push(&mut batches, own, None);
                    }
                    continue;
                }
            }

            let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
                continue;
            };
            let Some(handle) = self.handle_for(parent) else {
                crate::debug_event!("source", "unrouted", "{}", path.display());
                continue;
            };
            push(
                &mut batches,
                handle,
                Some(change.into_raw(PathBuf::from(name))),
            );
        }
        batches
    }
}

/// Append to the trailing batch when it belongs to the same handle.
fn push(batches: &mut Vec<EventBatch>, handle: WatchHandle, event: Option<RawEvent>) {
    match batches.last_mut() {
        Some(last) if last.handle == Some(handle) => last.events.extend(event),
        _ => batches.push(EventBatch::new(handle, event.into_iter().collect())),
    }
}

fn classify(event: &Event) -> Vec<(PathBuf, Change)> {
    let single = |change: Change| {
        event
            .paths
            .iter()
            .map(|p| (p.clone(), change))
            .collect::<Vec<_>>()
    };

    match event.kind {
        EventKind::Create(CreateKind::Folder) => single(Change::DirectoryCreated),
        EventKind::Create(_) => single(Change::Created),
        EventKind::Remove(RemoveKind::Folder) => single(Change::DirectoryDeleted),
        EventKind::Remove(_) => single(Change::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => single(Change::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => single(Change::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut changes = Vec::with_capacity(2);
            if let Some(from) = event.paths.first() {
                changes.push((from.clone(), Change::Deleted));
            }
            if let Some(to) = event.paths.get(1) {
                changes.push((to.clone(), Change::Created));
            }
            changes
        }
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|p| {
                let change = if p.symlink_metadata().is_ok() {
                    Change::Created
                } else {
                    Change::Deleted
                };
                (p.clone(), change)
            })
            .collect(),
        EventKind::Modify(_) => single(Change::Modified),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// Production event source over `notify::RecommendedWatcher`.
///
/// Every directory gets its own non-recursive watch and handle; the monitor
/// extends coverage itself as directories appear.
pub struct NotifySource {
    watcher: Mutex<Option<RecommendedWatcher>>,
    routes: Arc<Routes>,
    next_handle: AtomicU64,
    batches: Receiver<EventBatch>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    closed: AtomicBool,
}

impl NotifySource {
    /// Create the underlying OS watcher.
    pub fn open() -> MonitorResult<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);

        let routes = Arc::new(Routes::default());
        let callback_routes = Arc::clone(&routes);

        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for batch in callback_routes.translate(event) {
                    if tx.send(batch).is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                crate::warn_event!("source", "watch error", "{e}");
            }
        })?;

        crate::debug_event!("source", "opened");

        Ok(Self {
            watcher: Mutex::new(Some(watcher)),
            routes,
            next_handle: AtomicU64::new(1),
            batches: rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            closed: AtomicBool::new(false),
        })
    }

    /// Number of live watches.
    pub fn watch_count(&self) -> usize {
        self.routes.by_handle.len()
    }
}

impl std::fmt::Debug for NotifySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifySource")
            .field("watches", &self.watch_count())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl EventSource for NotifySource {
    fn watch(&self, dir: &Path) -> MonitorResult<WatchHandle> {
        let mut guard = self.watcher.lock();
        let watcher = guard
            .as_mut()
            .ok_or_else(|| MonitorError::registration(dir, "event source closed"))?;

        if let Some(existing) = self.routes.handle_for(dir) {
            return Ok(existing);
        }

        match dir.symlink_metadata() {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(MonitorError::registration(dir, "not a directory")),
            Err(e) => return Err(MonitorError::registration(dir, e)),
        }

        // Route first so events racing the watch call are not dropped.
        let handle = WatchHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.routes.insert(dir.to_path_buf(), handle);

        if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
            self.routes.remove(handle);
            return Err(MonitorError::registration(dir, e));
        }

        Ok(handle)
    }

    fn unwatch(&self, handle: WatchHandle) {
        let Some(dir) = self.routes.remove(handle) else {
            return;
        };
        if let Some(watcher) = self.watcher.lock().as_mut() {
            // The OS usually drops the watch together with the directory.
            if let Err(e) = watcher.unwatch(&dir) {
                crate::debug_event!("source", "unwatch", "{}: {e}", dir.display());
            }
        }
    }

    fn next_batch(&self) -> Option<EventBatch> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        crossbeam_channel::select! {
            recv(self.batches) -> batch => batch.ok(),
            recv(self.shutdown_rx) -> _ => None,
        }
    }

    fn is_valid(&self, handle: WatchHandle) -> bool {
        let Some(dir) = self.routes.by_handle.get(&handle).map(|d| d.value().clone()) else {
            return false;
        };
        dir.symlink_metadata()
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the watcher drops the callback's sender; dropping the
        // shutdown sender wakes any blocked `next_batch`.
        drop(self.watcher.lock().take());
        drop(self.shutdown_tx.lock().take());
        self.routes.clear();
        crate::debug_event!("source", "closed");
    }
}

impl Drop for NotifySource {
    fn drop(&mut self) {
        self.close();
    }
}
