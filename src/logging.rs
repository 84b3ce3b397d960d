//! Logging setup for the monitor and its binary.
//!
//! Diagnostics go to stderr so that `treewatch watch` can keep stdout for
//! the change lines it prints. Every component logs under its own target,
//! `treewatch::<component>`, which is what the level overrides in the
//! settings file select:
//!
//! ```toml
//! [logging]
//! default = "warn"
//!
//! [logging.modules]
//! "treewatch::monitor" = "debug"   # per-event dispatch traces
//! "treewatch::source" = "debug"    # notify routing
//! ```
//!
//! `RUST_LOG` replaces the configured filter entirely:
//! ```bash
//! RUST_LOG=treewatch::registry=debug treewatch watch ./src -e rs
//! ```

use std::sync::Once;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Level used when a configured filter fails to parse.
const FALLBACK_LEVEL: &str = "warn";

static INIT: Once = Once::new();

/// Wall-clock `HH:MM:SS.mmm`.
struct CompactTime;

impl FormatTime for CompactTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

/// Filter directives for `config`: the default level followed by the
/// per-target overrides in sorted order.
pub fn filter_directives(config: &LoggingConfig) -> String {
    let mut overrides: Vec<_> = config.modules.iter().collect();
    overrides.sort();

    let mut directives = config.default.trim().to_string();
    for (target, level) in overrides {
        directives.push_str(&format!(",{target}={level}"));
    }
    directives
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let directives = filter_directives(config);
    EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("Warning: invalid logging configuration `{directives}`: {e}");
        EnvFilter::new(FALLBACK_LEVEL)
    })
}

/// Install the stderr subscriber. Only the first call takes effect; a
/// subscriber installed elsewhere is left in place.
pub fn init_with_config(config: &LoggingConfig) {
    INIT.call_once(|| {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_timer(CompactTime)
            .with_filter(build_filter(config));

        let _ = tracing_subscriber::registry().with(layer).try_init();
    });
}

/// [`init_with_config`] with the default `warn` level.
pub fn init() {
    init_with_config(&LoggingConfig::default());
}

/// Lifecycle and summary events, logged at info under `treewatch::<component>`.
///
/// ```ignore
/// log_event!("registry", "tree registered", "{}", root.display());
/// log_event!("monitor", "stopped");
/// ```
#[macro_export]
macro_rules! log_event {
    ($component:literal, $event:expr) => {
        tracing::info!(target: concat!("treewatch::", $component), "{}", $event)
    };
    ($component:literal, $event:expr, $($arg:tt)*) => {
        tracing::info!(target: concat!("treewatch::", $component), "{}: {}", $event, format!($($arg)*))
    };
}

/// Per-event detail, logged at debug.
#[macro_export]
macro_rules! debug_event {
    ($component:literal, $event:expr) => {
        tracing::debug!(target: concat!("treewatch::", $component), "{}", $event)
    };
    ($component:literal, $event:expr, $($arg:tt)*) => {
        tracing::debug!(target: concat!("treewatch::", $component), "{}: {}", $event, format!($($arg)*))
    };
}

/// Skipped work the monitor recovers from: unwatchable directories, overflow.
#[macro_export]
macro_rules! warn_event {
    ($component:literal, $event:expr) => {
        tracing::warn!(target: concat!("treewatch::", $component), "{}", $event)
    };
    ($component:literal, $event:expr, $($arg:tt)*) => {
        tracing::warn!(target: concat!("treewatch::", $component), "{}: {}", $event, format!($($arg)*))
    };
}

/// Listener failures.
#[macro_export]
macro_rules! error_event {
    ($component:literal, $event:expr, $($arg:tt)*) => {
        tracing::error!(target: concat!("treewatch::", $component), "{}: {}", $event, format!($($arg)*))
    };
}
