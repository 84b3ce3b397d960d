//! Recursive directory monitoring with extension filtering and listener fan-out.
//!
//! # Architecture
//!
//! ```text
//! FileMonitor (control loop, lifecycle)
//!   - EventSource (NotifySource: one notify watch per directory)
//!   - WatchRegistry (handle <-> directory, recursive registration)
//!   - PathFilter (extension selectors)
//!   - ListenerHub (copy-on-write fan-out)
//!         |
//!    +---------+---------+
//!    |         |         |
//! file_added file_removed file_changed
//! ```

mod error;
mod file_monitor;
mod filter;
mod listener;
mod notify_source;
mod registry;
mod source;

pub use error::{MonitorError, MonitorResult};
pub use file_monitor::{FileMonitor, FileMonitorBuilder, MonitorState, SourceFactory};
pub use filter::PathFilter;
pub use listener::{
    ChangeKind, ChannelListener, FileChange, FileChangeListener, ListenerHub, ListenerId,
};
pub use notify_source::NotifySource;
pub use registry::{TreeRegistration, WatchRegistry};
pub use source::{EventBatch, EventSource, RawEvent, WatchHandle};
