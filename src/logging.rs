//! Logging callback (spec §6) bridged onto `tracing`.
//!
//! A cluster's logger is a per-instance closure, not a global — there is no
//! library-wide logging singleton (spec §9). Every call to [`Logger::log`]
//! also emits the matching `tracing` event, so a host that never installs a
//! callback still sees output if it installs a `tracing_subscriber`.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// Conventional syslog priority levels (0 = emerg ... 7 = debug).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Emerg = 0,
    Alert = 1,
    Crit = 2,
    Err = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Emerg => "emerg",
            Priority::Alert => "alert",
            Priority::Crit => "crit",
            Priority::Err => "err",
            Priority::Warning => "warning",
            Priority::Notice => "notice",
            Priority::Info => "info",
            Priority::Debug => "debug",
        };
        f.write_str(s)
    }
}

pub type LogCallback = dyn Fn(Priority, &str) + Send + Sync;

/// Holds the optional host-supplied logging callback and re-emits every
/// message as a `tracing` event at the matching level.
///
/// Backed by a shared cell rather than a plain field: `set_logger` is one of
/// the two setters allowed to run while a cluster is `JOINED` (spec §6), and
/// the heartbeat/watch loops hold their own clone of this `Logger` for the
/// lifetime of the background task, so a callback installed mid-flight must
/// still reach them.
#[derive(Clone)]
pub struct Logger {
    callback: Arc<RwLock<Option<Arc<LogCallback>>>>,
}

impl Logger {
    pub fn new() -> Self {
        Logger {
            callback: Arc::new(RwLock::new(None)),
        }
    }

    pub fn set_callback(&self, callback: Option<Arc<LogCallback>>) {
        *self.callback.write() = callback;
    }

    pub fn log(&self, priority: Priority, message: &str) {
        match priority {
            Priority::Emerg | Priority::Alert | Priority::Crit | Priority::Err => {
                tracing::error!(%priority, "{}", message)
            }
            Priority::Warning => tracing::warn!(%priority, "{}", message),
            Priority::Notice | Priority::Info => tracing::info!(%priority, "{}", message),
            Priority::Debug => tracing::debug!(%priority, "{}", message),
        }
        if let Some(cb) = self.callback.read().clone() {
            cb(priority, message);
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("callback_installed", &self.callback.read().is_some())
            .finish()
    }
}
