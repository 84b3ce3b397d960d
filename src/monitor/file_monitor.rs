//! The monitor control loop and its lifecycle.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};

use crate::config::Settings;

use super::error::{MonitorError, MonitorResult};
use super::filter::PathFilter;
use super::listener::{ChangeKind, FileChangeListener, ListenerHub, ListenerId};
use super::notify_source::NotifySource;
use super::registry::WatchRegistry;
use super::source::{EventBatch, EventSource, RawEvent};

/// Opens the event source when the monitor starts.
pub type SourceFactory = dyn Fn() -> MonitorResult<Arc<dyn EventSource>> + Send + Sync;

/// Lifecycle of a [`FileMonitor`]. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Running,
    Stopped,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MonitorState::Idle => "idle",
            MonitorState::Running => "running",
            MonitorState::Stopped => "stopped",
        })
    }
}

/// Recursive directory monitor.
///
/// Watches every configured root and each directory below it, including
/// directories created after [`FileMonitor::start`], and notifies listeners
/// about files whose extension matches a selector.
///
/// All methods take `&self`: share the monitor through an `Arc`, drive
/// [`FileMonitor::run`] on one thread (see [`FileMonitor::spawn`]) and
/// configure or [`FileMonitor::stop`] it from any other.
///
/// ```no_run
/// use std::sync::Arc;
/// use treewatch::{ChannelListener, FileMonitor};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (tx, rx) = crossbeam_channel::unbounded();
/// let monitor = Arc::new(
///     FileMonitor::builder()
///         .watch_dir("./src")
///         .selector("rs")
///         .listener(Arc::new(ChannelListener::new(tx)))
///         .build(),
/// );
///
/// monitor.start()?;
/// let worker = monitor.spawn()?;
/// for change in rx.iter().take(10) {
///     println!("{change:?}");
/// }
/// monitor.stop();
/// worker.join().expect("monitor thread panicked")?;
/// # Ok(())
/// # }
/// ```
pub struct FileMonitor {
    roots: RwLock<Vec<PathBuf>>,
    filter: PathFilter,
    listeners: ListenerHub,
    open_source: Box<SourceFactory>,
    registry: RwLock<Option<Arc<WatchRegistry>>>,
    state: Mutex<MonitorState>,
}

impl FileMonitor {
    /// Monitor with no roots, selectors or listeners, backed by `notify`.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> FileMonitorBuilder {
        FileMonitorBuilder::new()
    }

    /// Monitor configured from loaded settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::builder()
            .watch_dirs(settings.roots.iter().cloned())
            .selectors(settings.selectors.iter().cloned())
            .build()
    }

    pub fn add_listener(&self, listener: Arc<dyn FileChangeListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Add an extension selector; takes effect for the next event.
    pub fn add_selector(&self, ext: &str) -> bool {
        let added = self.filter.add_selector(ext);
        if added {
            crate::debug_event!("monitor", "selector added", "{ext}");
        }
        added
    }

    /// Add a root directory.
    ///
    /// Before start the root is only recorded. While running its tree is
    /// registered immediately; the root is recorded only if that succeeds.
    pub fn add_watched_dir(&self, dir: impl AsRef<Path>) -> MonitorResult<()> {
        let dir = normalize_root(dir.as_ref());
        let state = self.state.lock();

        if *state == MonitorState::Running {
            if let Some(registry) = self.registry.read().clone() {
                registry.register_tree(&dir)?;
            }
        }

        let mut roots = self.roots.write();
        if !roots.contains(&dir) {
            roots.push(dir);
        }
        Ok(())
    }

    /// Open the event source and register every root.
    ///
    /// Roots that fail to register are logged and skipped. If none succeeds
    /// the source is released, `NoWatchTargets` is returned and the monitor
    /// stays idle.
    pub fn start(&self) -> MonitorResult<()> {
        let mut state = self.state.lock();
        match *state {
            MonitorState::Idle => {}
            MonitorState::Running => return Err(MonitorError::AlreadyStarted),
            MonitorState::Stopped => return Err(MonitorError::Stopped),
        }

        let source = (self.open_source)()?;
        let registry = Arc::new(WatchRegistry::new(source));

        let roots = self.roots.read().clone();
        let mut watched = 0;
        for root in &roots {
            match registry.register_tree(root) {
                Ok(_) => watched += 1,
                Err(e) => crate::warn_event!("monitor", "root unavailable", "{e}"),
            }
        }

        if watched == 0 {
            registry.shutdown();
            return Err(MonitorError::NoWatchTargets);
        }

        let directories = registry.len();
        *self.registry.write() = Some(registry);
        *state = MonitorState::Running;

        crate::log_event!(
            "monitor",
            "started",
            "{watched}/{} roots, {directories} directories",
            roots.len()
        );
        Ok(())
    }

    /// Process batches until stopped or nothing is left to watch.
    pub fn run(&self) -> MonitorResult<()> {
        self.run_loop(None)
    }

    /// Process at most `count` batches. `0` returns immediately.
    ///
    /// The monitor is stopped when the loop exits, including when the
    /// budget runs out.
    pub fn run_batches(&self, count: usize) -> MonitorResult<()> {
        if count == 0 {
            return Ok(());
        }
        self.run_loop(Some(count))
    }

    /// Run [`FileMonitor::run`] on a dedicated thread.
    pub fn spawn(self: &Arc<Self>) -> std::io::Result<JoinHandle<MonitorResult<()>>> {
        let monitor = Arc::clone(self);
        std::thread::Builder::new()
            .name("treewatch-monitor".to_string())
            .spawn(move || monitor.run())
    }

    /// Stop monitoring and release the event source. Idempotent.
    ///
    /// Closing the source wakes a `run` blocked waiting for events.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == MonitorState::Stopped {
                return;
            }
            *state = MonitorState::Stopped;
        }

        let registry = self.registry.write().take();
        if let Some(registry) = registry {
            registry.shutdown();
        }
        crate::log_event!("monitor", "stopped");
    }

    pub fn state(&self) -> MonitorState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == MonitorState::Running
    }

    pub fn watched_roots(&self) -> Vec<PathBuf> {
        self.roots.read().clone()
    }

    /// Every directory currently covered, sorted. Empty unless running.
    pub fn watched_directories(&self) -> Vec<PathBuf> {
        self.registry
            .read()
            .as_ref()
            .map(|registry| registry.directories())
            .unwrap_or_default()
    }

    pub fn selectors(&self) -> Vec<String> {
        self.filter.selectors()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn run_loop(&self, budget: Option<usize>) -> MonitorResult<()> {
        let registry = match self.state() {
            MonitorState::Idle => return Err(MonitorError::NotRunning),
            MonitorState::Stopped => return Ok(()),
            MonitorState::Running => self
                .registry
                .read()
                .clone()
                .ok_or(MonitorError::NotRunning)?,
        };
        let source = Arc::clone(registry.source());
        let mut remaining = budget;

        while self.is_running() {
            let Some(batch) = source.next_batch() else {
                crate::debug_event!("monitor", "event source closed");
                break;
            };

            self.process_batch(&registry, &batch);

            if let Some(handle) = batch.handle {
                if !source.is_valid(handle) && registry.invalidate(handle) {
                    crate::log_event!("monitor", "nothing left to watch");
                    break;
                }
            }

            if let Some(left) = remaining.as_mut() {
                *left -= 1;
                if *left == 0 {
                    crate::debug_event!("monitor", "batch budget exhausted");
                    break;
                }
            }
        }

        self.stop();
        Ok(())
    }

    fn process_batch(&self, registry: &WatchRegistry, batch: &EventBatch) {
        for event in &batch.events {
            let (kind, relative) = match event {
                RawEvent::Created(p) => (Some(ChangeKind::Added), p),
                RawEvent::Modified(p) => (Some(ChangeKind::Changed), p),
                RawEvent::Deleted(p) => (Some(ChangeKind::Removed), p),
                RawEvent::DirectoryCreated(p) | RawEvent::DirectoryDeleted(p) => (None, p),
                RawEvent::Overflow => {
                    match batch.handle.and_then(|h| registry.resolve(h).ok()) {
                        Some(dir) => crate::warn_event!(
                            "monitor",
                            "event overflow",
                            "{}, some changes were lost",
                            dir.display()
                        ),
                        None => {
                            crate::warn_event!("monitor", "event overflow", "some changes were lost")
                        }
                    }
                    continue;
                }
            };

            let Some(handle) = batch.handle else {
                crate::debug_event!("monitor", "skipped", "unattributed event");
                continue;
            };
            let dir = match registry.resolve(handle) {
                Ok(dir) => dir,
                Err(e) => {
                    crate::debug_event!("monitor", "skipped", "{e}");
                    continue;
                }
            };
            let path = dir.join(relative);

            let is_creation = matches!(
                event,
                RawEvent::Created(_) | RawEvent::DirectoryCreated(_)
            );
            if is_creation {
                if is_directory(&path) {
                    if let Err(e) = registry.register_tree(&path) {
                        crate::warn_event!("monitor", "new directory not watched", "{e}");
                    }
                } else if kind.is_some() {
                    registry.forget_retired(&path);
                }
            }

            // Directories, live or already gone, are never dispatched.
            let Some(kind) = kind else {
                crate::debug_event!("monitor", "directory", "{}", path.display());
                continue;
            };
            if registry.is_known_directory(&path) || is_directory(&path) {
                continue;
            }
            if !self.filter.matches(&path) {
                crate::debug_event!("monitor", "unmatched", "{kind} {}", path.display());
                continue;
            }

            crate::debug_event!("monitor", "dispatch", "{kind} {}", path.display());
            self.listeners.dispatch(kind, &path);
        }
    }
}

impl Default for FileMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FileMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for FileMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMonitor")
            .field("state", &self.state())
            .field("roots", &self.watched_roots())
            .field("selectors", &self.selectors())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Directory check that does not follow symlinks.
fn is_directory(path: &Path) -> bool {
    path.symlink_metadata()
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

/// Canonical path when the root exists, otherwise made absolute.
fn normalize_root(dir: &Path) -> PathBuf {
    std::fs::canonicalize(dir)
        .or_else(|_| std::path::absolute(dir))
        .unwrap_or_else(|_| dir.to_path_buf())
}

fn open_notify_source() -> MonitorResult<Arc<dyn EventSource>> {
    Ok(Arc::new(NotifySource::open()?))
}

/// Builder for a [`FileMonitor`] with initial listeners, selectors and roots.
pub struct FileMonitorBuilder {
    listeners: Vec<Arc<dyn FileChangeListener>>,
    selectors: Vec<String>,
    roots: Vec<PathBuf>,
    open_source: Option<Box<SourceFactory>>,
}

impl FileMonitorBuilder {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
            selectors: Vec::new(),
            roots: Vec::new(),
            open_source: None,
        }
    }

    pub fn listener(mut self, listener: Arc<dyn FileChangeListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn selector(mut self, ext: impl Into<String>) -> Self {
        self.selectors.push(ext.into());
        self
    }

    pub fn selectors<I, S>(mut self, exts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selectors.extend(exts.into_iter().map(Into::into));
        self
    }

    pub fn watch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.roots.push(dir.into());
        self
    }

    pub fn watch_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.roots.extend(dirs.into_iter().map(Into::into));
        self
    }

    /// Use an already opened source instead of `notify`.
    pub fn source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.open_source = Some(Box::new(move || Ok(Arc::clone(&source))));
        self
    }

    /// Open the source lazily with `factory` when the monitor starts.
    pub fn source_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> MonitorResult<Arc<dyn EventSource>> + Send + Sync + 'static,
    {
        self.open_source = Some(Box::new(factory));
        self
    }

    pub fn build(self) -> FileMonitor {
        let open_source: Box<SourceFactory> = match self.open_source {
            Some(factory) => factory,
            None => Box::new(open_notify_source),
        };

        let monitor = FileMonitor {
            roots: RwLock::new(Vec::new()),
            filter: PathFilter::with_selectors(&self.selectors),
            listeners: ListenerHub::new(),
            open_source,
            registry: RwLock::new(None),
            state: Mutex::new(MonitorState::Idle),
        };

        for listener in self.listeners {
            monitor.add_listener(listener);
        }
        {
            let mut roots = monitor.roots.write();
            for root in &self.roots {
                let root = normalize_root(root);
                if !roots.contains(&root) {
                    roots.push(root);
                }
            }
        }
        monitor
    }
}

impl Default for FileMonitorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builder_collects_configuration() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().canonicalize().unwrap();

        let monitor = FileMonitor::builder()
            .watch_dir(&root)
            .watch_dir(&root)
            .selectors(["rs", ".toml"])
            .build();

        assert_eq!(monitor.state(), MonitorState::Idle);
        assert_eq!(monitor.watched_roots(), vec![root]);
        assert_eq!(monitor.selectors(), vec!["rs".to_string(), "toml".to_string()]);
        assert!(monitor.watched_directories().is_empty());
    }

    #[test]
    fn test_run_before_start_is_an_error() {
        let monitor = FileMonitor::new();
        assert!(matches!(monitor.run(), Err(MonitorError::NotRunning)));
        assert!(monitor.run_batches(0).is_ok());
    }

    #[test]
    fn test_start_without_roots_fails_fast() {
        let monitor = FileMonitor::new();
        assert!(matches!(monitor.start(), Err(MonitorError::NoWatchTargets)));
        assert_eq!(monitor.state(), MonitorState::Idle);
    }

    #[test]
    fn test_start_with_only_missing_roots_fails_fast() {
        let temp_dir = TempDir::new().unwrap();
        let monitor = FileMonitor::builder()
            .watch_dir(temp_dir.path().join("missing"))
            .build();

        let err = monitor.start().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, MonitorError::NoWatchTargets));

        // Recoverable: add a real root and retry.
        monitor.add_watched_dir(temp_dir.path()).unwrap();
        monitor.start().unwrap();
        assert!(monitor.is_running());
        monitor.stop();
    }

    #[test]
    fn test_source_failure_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let monitor = FileMonitor::builder()
            .watch_dir(temp_dir.path())
            .source_factory(|| {
                Err(MonitorError::SourceUnavailable {
                    reason: "inotify limit reached".to_string(),
                })
            })
            .build();

        let err = monitor.start().unwrap_err();
        assert!(matches!(err, MonitorError::SourceUnavailable { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_stop_is_terminal_and_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let monitor = FileMonitor::builder().watch_dir(temp_dir.path()).build();

        monitor.start().unwrap();
        assert!(matches!(monitor.start(), Err(MonitorError::AlreadyStarted)));

        monitor.stop();
        monitor.stop();

        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert!(monitor.watched_directories().is_empty());
        assert!(matches!(monitor.start(), Err(MonitorError::Stopped)));
        assert!(monitor.run().is_ok());
    }
}
