//! Event-bus based logging.
//!
//! A log call emits an [`EventType::Log`](crate::EventType::Log) event as the current task.
//! Destinations registered with [`start_logging`] on some ancestor format and write it; other
//! handlers can observe the same events. Outside of any task, log calls write straight to the
//! destinations registered so far.
//!
//! ```text
//! log("msg") ──► Event(Log) ──► task ──► parent ──► … ──► root ── start_logging handler ──► stdout
//! ```
//!
//! Formatting is customized through the [`LogContext`] variables.

mod destination;
mod format;

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::SystemTime;

use crate::context::{ContextMap, ContextVar};
use crate::core::{Task, current_task_or_none, root_task};
use crate::error::{TaskError, TaskId};
use crate::events::Event;

pub use destination::{LogDestination, install_root_error_handler, start_debug_event_logging, start_logging};
pub use format::{default_log_format, default_time_format};

pub(crate) use destination::clear_root_destinations;

/// Severity of a log message, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Lowercase level name.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Formats a log event into one or more lines.
pub type LogFormatter = Rc<dyn Fn(&Event) -> String>;

/// Formats the timestamp of a log event.
pub type TimeFormatter = Rc<dyn Fn(SystemTime) -> String>;

/// Context variables customizing log output.
///
/// The prefix variables and levels are read from the task that emitted a message; the two
/// formatters are read from the task that writes it.
pub struct LogContext;

impl LogContext {
    /// Prefix of every line.
    pub const APP_NAME: ContextVar<Option<String>> = ContextVar::with_default("LogContext", "app_name", none);
    /// Working directory shown in brackets.
    pub const WORK_DIR: ContextVar<Option<String>> = ContextVar::with_default("LogContext", "work_dir", none);
    /// Scope shown before the message.
    pub const SCOPE: ContextVar<Option<String>> = ContextVar::with_default("LogContext", "scope", none);
    /// Downgrade info messages to debug before they are emitted.
    pub const QUIET: ContextVar<bool> = ContextVar::with_default("LogContext", "quiet", bool::default);
    /// Minimum level written by destinations without a specific level.
    pub const LEVEL: ContextVar<LogLevel> = ContextVar::with_default("LogContext", "level", LogLevel::default);
    /// Minimum level per destination label.
    pub const DEST_LEVELS: ContextMap<String, LogLevel> = ContextMap::new("LogContext", "dest_levels");
    /// Line formatter.
    pub const LOG_FORMAT: ContextVar<LogFormatter> =
        ContextVar::with_default("LogContext", "log_format", default_log_formatter);
    /// Timestamp formatter used by [`default_log_format`].
    pub const TIME_FORMAT: ContextVar<TimeFormatter> =
        ContextVar::with_default("LogContext", "time_format", format::default_time_format_fn);
}

fn none() -> Option<String> {
    None
}

fn default_log_formatter() -> LogFormatter {
    Rc::new(default_log_format)
}

/// Logs `message` at info level and returns the emitted event.
pub fn log(message: impl Into<String>) -> Event {
    log_at(LogLevel::Info, message)
}

pub fn log_debug(message: impl Into<String>) -> Event {
    log_at(LogLevel::Debug, message)
}

pub fn log_warning(message: impl Into<String>) -> Event {
    log_at(LogLevel::Warning, message)
}

/// Logs `message` at error level and returns a [`TaskError::Logged`] for `return Err(...)`.
pub fn log_error(message: impl Into<String>) -> TaskError {
    let event = log_at(LogLevel::Error, message);
    TaskError::Logged { message: event.message.unwrap_or_else(|| Arc::from("")), cause: None }
}

/// Logs `message` at `level`.
///
/// With `LogContext::QUIET` set, info messages are emitted as debug messages.
pub fn log_at(level: LogLevel, message: impl Into<String>) -> Event {
    let quiet = LogContext::QUIET.get().unwrap_or_default();
    let level = if quiet && level == LogLevel::Info { LogLevel::Debug } else { level };
    let event = Event::log(level, message.into());
    if event.clone().emit().is_err() {
        destination::write_to_root_destinations(&event);
    }
    event
}

thread_local! {
    static ALREADY_LOGGED: std::cell::RefCell<HashMap<usize, (Arc<TaskError>, TaskError)>> =
        std::cell::RefCell::new(HashMap::new());
}

/// Logs an error once and returns it as [`TaskError::Logged`].
///
/// Failure wrappers are unwrapped to the innermost cause, which is logged as the task that
/// raised it. The same cause reached through several wrappers (e.g. a failed child seen by its
/// parent and by a dependent) is logged only once; later calls return the first result. An error
/// that is already `Logged` is returned unchanged.
pub fn log_exception(err: &TaskError) -> TaskError {
    let mut source = current_task_or_none();
    let mut innermost: Option<&Arc<TaskError>> = None;
    let mut current = err;
    while current.is_failure() {
        let (Some(task), Some(cause)) = (current.aborted_task(), current.cause()) else {
            break;
        };
        if let Some(found) = find_task(task.id) {
            source = Some(found);
        }
        innermost = Some(cause);
        current = cause;
    }

    if let TaskError::Logged { .. } = current {
        return current.clone();
    }

    let key = innermost.map(|cause| Arc::as_ptr(cause) as usize);
    if let Some(key) = key {
        if let Some(logged) = ALREADY_LOGGED.with(|l| l.borrow().get(&key).map(|(_, logged)| logged.clone())) {
            return logged;
        }
    }

    let message = current.as_message();
    let event = match &source {
        Some(task) => task.as_current_task(|| log_at(LogLevel::Error, message)),
        None => log_at(LogLevel::Error, message),
    };
    let logged = TaskError::Logged {
        message: event.message.unwrap_or_else(|| Arc::from("")),
        cause: Some(Arc::new(err.clone())),
    };
    if let (Some(key), Some(cause)) = (key, innermost) {
        ALREADY_LOGGED.with(|l| l.borrow_mut().insert(key, (cause.clone(), logged.clone())));
    }
    logged
}

/// Forgets which errors were logged; called when a task loop ends.
pub(crate) fn forget_logged_errors() {
    ALREADY_LOGGED.with(|l| l.borrow_mut().clear());
}

fn find_task(id: TaskId) -> Option<Task> {
    let mut stack = vec![root_task().ok()?];
    while let Some(task) = stack.pop() {
        if task.id() == id {
            return Some(task);
        }
        stack.extend(task.children());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_order() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warning < LogLevel::Error);
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_log_error_returns_logged() {
        let err = log_error("bad input");
        assert!(matches!(&err, TaskError::Logged { message, cause: None } if &**message == "bad input"));
    }

    #[test]
    fn test_log_exception_keeps_logged_errors() {
        let logged = log_error("already reported");
        let again = log_exception(&logged);
        assert_eq!(again.to_string(), "already reported");
    }
}
