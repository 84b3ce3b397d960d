//! Listener trait and the copy-on-write fan-out hub.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::Sender;
use parking_lot::RwLock;

use super::error::MonitorError;

/// Observer notified about matching file changes.
///
/// Paths are absolute and always refer to files, never directories.
/// Callbacks run on the monitor thread; a panic is caught and logged.
pub trait FileChangeListener: Send + Sync {
    fn file_added(&self, path: &Path);
    fn file_removed(&self, path: &Path);
    fn file_changed(&self, path: &Path);
}

/// Which callback a dispatch invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Removed,
    Changed,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
            ChangeKind::Changed => "changed",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dispatched change, as delivered by [`ChannelListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Added(PathBuf),
    Removed(PathBuf),
    Changed(PathBuf),
}

impl FileChange {
    pub fn new(kind: ChangeKind, path: PathBuf) -> Self {
        match kind {
            ChangeKind::Added => FileChange::Added(path),
            ChangeKind::Removed => FileChange::Removed(path),
            ChangeKind::Changed => FileChange::Changed(path),
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            FileChange::Added(_) => ChangeKind::Added,
            FileChange::Removed(_) => ChangeKind::Removed,
            FileChange::Changed(_) => ChangeKind::Changed,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            FileChange::Added(p) | FileChange::Removed(p) | FileChange::Changed(p) => p,
        }
    }
}

/// Forwards every callback into a channel.
///
/// Sends to a disconnected receiver are dropped silently.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    sender: Sender<FileChange>,
}

impl ChannelListener {
    pub fn new(sender: Sender<FileChange>) -> Self {
        Self { sender }
    }

    fn send(&self, kind: ChangeKind, path: &Path) {
        let _ = self.sender.send(FileChange::new(kind, path.to_path_buf()));
    }
}

impl FileChangeListener for ChannelListener {
    fn file_added(&self, path: &Path) {
        self.send(ChangeKind::Added, path);
    }

    fn file_removed(&self, path: &Path) {
        self.send(ChangeKind::Removed, path);
    }

    fn file_changed(&self, path: &Path) {
        self.send(ChangeKind::Changed, path);
    }
}

/// Identifies a registered listener for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Entry = (ListenerId, Arc<dyn FileChangeListener>);

/// Thread-safe listener registry with snapshot dispatch.
///
/// Mutations replace the whole list; `dispatch` clones the current `Arc` and
/// iterates it with no lock held, so listeners may add or remove listeners
/// (themselves included) from inside a callback.
pub struct ListenerHub {
    listeners: RwLock<Arc<Vec<Entry>>>,
    next_id: AtomicU64,
}

impl ListenerHub {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener; it sees every dispatch that starts afterwards.
    pub fn add(&self, listener: Arc<dyn FileChangeListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut guard = self.listeners.write();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push((id, listener));
        *guard = Arc::new(next);

        crate::debug_event!("listeners", "added", "{id}");
        id
    }

    /// Unregister a listener. Returns false if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.write();
        if !guard.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        let next: Vec<Entry> = guard
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        *guard = Arc::new(next);

        crate::debug_event!("listeners", "removed", "{id}");
        true
    }

    /// Invoke every listener registered at the start of the call, in
    /// registration order. Panicking listeners are logged and skipped.
    pub fn dispatch(&self, kind: ChangeKind, path: &Path) {
        let snapshot = self.listeners.read().clone();

        for (id, listener) in snapshot.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| match kind {
                ChangeKind::Added => listener.file_added(path),
                ChangeKind::Removed => listener.file_removed(path),
                ChangeKind::Changed => listener.file_changed(path),
            }));

            if let Err(payload) = outcome {
                let failure = MonitorError::ListenerFailure {
                    listener: *id,
                    reason: panic_message(payload.as_ref()),
                };
                crate::error_event!("listeners", "dispatch failed", "{kind} {}: {failure}", path.display());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }
}

impl Default for ListenerHub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ListenerHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHub")
            .field("listeners", &self.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "listener panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::OnceLock;
    use std::sync::Weak;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(ChangeKind, PathBuf)>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<(ChangeKind, PathBuf)> {
            self.calls.lock().clone()
        }
    }

    impl FileChangeListener for Recorder {
        fn file_added(&self, path: &Path) {
            self.calls.lock().push((ChangeKind::Added, path.to_path_buf()));
        }
        fn file_removed(&self, path: &Path) {
            self.calls.lock().push((ChangeKind::Removed, path.to_path_buf()));
        }
        fn file_changed(&self, path: &Path) {
            self.calls.lock().push((ChangeKind::Changed, path.to_path_buf()));
        }
    }

    struct Panicker;

    impl FileChangeListener for Panicker {
        fn file_added(&self, _path: &Path) {
            panic!("boom");
        }
        fn file_removed(&self, _path: &Path) {}
        fn file_changed(&self, _path: &Path) {}
    }

    /// Removes itself on its first callback.
    struct OneShot {
        hub: Weak<ListenerHub>,
        id: OnceLock<ListenerId>,
        seen: Mutex<usize>,
    }

    impl FileChangeListener for OneShot {
        fn file_added(&self, _path: &Path) {
            *self.seen.lock() += 1;
            if let (Some(hub), Some(id)) = (self.hub.upgrade(), self.id.get()) {
                hub.remove(*id);
            }
        }
        fn file_removed(&self, _path: &Path) {}
        fn file_changed(&self, _path: &Path) {}
    }

    #[test]
    fn test_dispatch_maps_kinds_in_registration_order() {
        let hub = ListenerHub::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        hub.add(first.clone());
        hub.add(second.clone());

        let path = Path::new("/root/a.txt");
        hub.dispatch(ChangeKind::Added, path);
        hub.dispatch(ChangeKind::Changed, path);
        hub.dispatch(ChangeKind::Removed, path);

        let expected = vec![
            (ChangeKind::Added, path.to_path_buf()),
            (ChangeKind::Changed, path.to_path_buf()),
            (ChangeKind::Removed, path.to_path_buf()),
        ];
        assert_eq!(first.calls(), expected);
        assert_eq!(second.calls(), expected);
    }

    #[test]
    fn test_remove_listener() {
        let hub = ListenerHub::new();
        let recorder = Arc::new(Recorder::default());
        let id = hub.add(recorder.clone());

        assert!(hub.remove(id));
        assert!(!hub.remove(id));
        assert!(hub.is_empty());

        hub.dispatch(ChangeKind::Added, Path::new("/root/a.txt"));
        assert!(recorder.calls().is_empty());
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let hub = ListenerHub::new();
        let recorder = Arc::new(Recorder::default());
        hub.add(Arc::new(Panicker));
        hub.add(recorder.clone());

        hub.dispatch(ChangeKind::Added, Path::new("/root/a.txt"));

        assert_eq!(recorder.calls().len(), 1);
        assert_eq!(hub.len(), 2);
    }

    #[test]
    fn test_listener_removing_itself_during_dispatch() {
        let hub = Arc::new(ListenerHub::new());
        let one_shot = Arc::new(OneShot {
            hub: Arc::downgrade(&hub),
            id: OnceLock::new(),
            seen: Mutex::new(0),
        });
        let id = hub.add(one_shot.clone());
        one_shot.id.set(id).unwrap();
        let recorder = Arc::new(Recorder::default());
        hub.add(recorder.clone());

        hub.dispatch(ChangeKind::Added, Path::new("/root/a.txt"));
        hub.dispatch(ChangeKind::Added, Path::new("/root/b.txt"));

        assert_eq!(*one_shot.seen.lock(), 1);
        assert_eq!(recorder.calls().len(), 2);
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn test_listener_added_during_dispatch_sees_event_at_most_once() {
        struct Adder {
            hub: Weak<ListenerHub>,
            added: Arc<Recorder>,
        }

        impl FileChangeListener for Adder {
            fn file_added(&self, _path: &Path) {
                if let Some(hub) = self.hub.upgrade() {
                    hub.add(self.added.clone());
                }
            }
            fn file_removed(&self, _path: &Path) {}
            fn file_changed(&self, _path: &Path) {}
        }

        let hub = Arc::new(ListenerHub::new());
        let late = Arc::new(Recorder::default());
        hub.add(Arc::new(Adder {
            hub: Arc::downgrade(&hub),
            added: late.clone(),
        }));

        hub.dispatch(ChangeKind::Added, Path::new("/root/a.txt"));
        assert!(late.calls().len() <= 1);
        assert_eq!(hub.len(), 2);
    }

    #[test]
    fn test_channel_listener_forwards_changes() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let hub = ListenerHub::new();
        hub.add(Arc::new(ChannelListener::new(tx)));

        hub.dispatch(ChangeKind::Removed, Path::new("/root/gone.rs"));

        let change = rx.try_recv().unwrap();
        assert_eq!(change, FileChange::Removed(PathBuf::from("/root/gone.rs")));
        assert_eq!(change.kind(), ChangeKind::Removed);
        assert_eq!(change.path(), Path::new("/root/gone.rs"));
    }
}
