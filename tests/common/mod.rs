//! Scripted in-memory event source for deterministic monitor tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select, unbounded};
use parking_lot::Mutex;
use treewatch::{EventBatch, EventSource, FileChange, MonitorError, MonitorResult, RawEvent, WatchHandle};

/// An [`EventSource`] whose batches are pushed by the test.
///
/// Watching succeeds for any path not marked rejected. Handles stay valid
/// until the test invalidates them.
pub struct ScriptedSource {
    next_handle: AtomicU64,
    dirs: Mutex<HashMap<WatchHandle, PathBuf>>,
    rejected: Mutex<HashSet<PathBuf>>,
    invalid: Mutex<HashSet<WatchHandle>>,
    unwatched: Mutex<Vec<WatchHandle>>,
    announced: Mutex<HashMap<PathBuf, Vec<RawEvent>>>,
    batch_tx: Sender<EventBatch>,
    batch_rx: Receiver<EventBatch>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    closed: AtomicBool,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        let (batch_tx, batch_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);
        Arc::new(Self {
            next_handle: AtomicU64::new(1),
            dirs: Mutex::new(HashMap::new()),
            rejected: Mutex::new(HashSet::new()),
            invalid: Mutex::new(HashSet::new()),
            unwatched: Mutex::new(Vec::new()),
            announced: Mutex::new(HashMap::new()),
            batch_tx,
            batch_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            closed: AtomicBool::new(false),
        })
    }

    /// Make `watch(dir)` fail.
    pub fn reject(&self, dir: &Path) {
        self.rejected.lock().insert(dir.to_path_buf());
    }

    /// Make `is_valid(handle)` report false from now on.
    pub fn invalidate(&self, handle: WatchHandle) {
        self.invalid.lock().insert(handle);
    }

    /// Deliver `events` for `dir` from inside `watch(dir)`, before the call
    /// returns, the way an OS watcher can report changes that race the
    /// registration.
    pub fn announce_on_watch(&self, dir: &Path, events: Vec<RawEvent>) {
        self.announced.lock().insert(dir.to_path_buf(), events);
    }

    pub fn push(&self, batch: EventBatch) {
        let _ = self.batch_tx.send(batch);
    }

    /// Push one batch for the directory watched as `dir`.
    pub fn push_for(&self, dir: &Path, events: Vec<RawEvent>) {
        let handle = self
            .handle_of(dir)
            .unwrap_or_else(|| panic!("{} is not watched", dir.display()));
        self.push(EventBatch::new(handle, events));
    }

    pub fn handle_of(&self, dir: &Path) -> Option<WatchHandle> {
        self.dirs
            .lock()
            .iter()
            .find(|(_, path)| path.as_path() == dir)
            .map(|(handle, _)| *handle)
    }

    /// Poll until `dir` is watched.
    pub fn wait_for_watch(&self, dir: &Path, timeout: Duration) -> Option<WatchHandle> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(handle) = self.handle_of(dir) {
                return Some(handle);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    pub fn watched(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.dirs.lock().values().cloned().collect();
        dirs.sort();
        dirs
    }

    pub fn unwatched(&self) -> Vec<WatchHandle> {
        self.unwatched.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl EventSource for ScriptedSource {
    fn watch(&self, dir: &Path) -> MonitorResult<WatchHandle> {
        if self.is_closed() {
            return Err(MonitorError::registration(dir, "source closed"));
        }
        if self.rejected.lock().contains(dir) {
            return Err(MonitorError::registration(dir, "rejected by script"));
        }
        if let Some(handle) = self.handle_of(dir) {
            return Ok(handle);
        }
        let handle = WatchHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.dirs.lock().insert(handle, dir.to_path_buf());

        let announced = self.announced.lock().remove(dir);
        if let Some(events) = announced {
            self.push(EventBatch::new(handle, events));
            // Give the worker time to pick the batch up before we return.
            std::thread::sleep(Duration::from_millis(100));
        }
        Ok(handle)
    }

    fn unwatch(&self, handle: WatchHandle) {
        self.dirs.lock().remove(&handle);
        self.unwatched.lock().push(handle);
    }

    fn next_batch(&self) -> Option<EventBatch> {
        if self.is_closed() {
            return None;
        }
        select! {
            recv(self.batch_rx) -> batch => batch.ok(),
            recv(self.shutdown_rx) -> _ => None,
        }
    }

    fn is_valid(&self, handle: WatchHandle) -> bool {
        self.dirs.lock().contains_key(&handle) && !self.invalid.lock().contains(&handle)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the sender disconnects the shutdown channel and wakes waiters.
        self.shutdown_tx.lock().take();
    }
}

/// Canonical path of a temp directory, matching what the monitor records.
pub fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap()
}

/// Drain everything already delivered to `rx`.
pub fn drain(rx: &Receiver<FileChange>) -> Vec<FileChange> {
    rx.try_iter().collect()
}

/// Receive changes until `count` arrived or `timeout` passed.
pub fn collect(rx: &Receiver<FileChange>, count: usize, timeout: Duration) -> Vec<FileChange> {
    let deadline = Instant::now() + timeout;
    let mut changes = Vec::new();
    while changes.len() < count {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        match rx.recv_timeout(deadline - now) {
            Ok(change) => changes.push(change),
            Err(_) => break,
        }
    }
    changes
}
