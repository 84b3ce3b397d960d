//! Recursive filesystem change monitoring.
//!
//! A [`FileMonitor`] watches directory trees, extends its coverage to
//! directories created while running, and reports files whose extension
//! matches a selector to registered [`FileChangeListener`]s.

pub mod config;
pub mod logging;
pub mod monitor;

pub use config::{LoggingConfig, Settings};
pub use monitor::{
    ChangeKind, ChannelListener, EventBatch, EventSource, FileChange, FileChangeListener,
    FileMonitor, FileMonitorBuilder, ListenerId, MonitorError, MonitorResult, MonitorState,
    NotifySource, PathFilter, RawEvent, WatchHandle,
};
