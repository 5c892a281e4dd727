//! # Events emitted on task buses.
//!
//! The [`EventType`] enum classifies events into a static is-a hierarchy. A subscriber for a
//! type receives events of that type and of all its subtypes:
//!
//! ```text
//! Any
//!  ├─ Debug
//!  │   ├─ StateChange
//!  │   └─ ExceptionPropagation
//!  ├─ Interrupted
//!  ├─ Log
//!  ├─ Process
//!  │   ├─ Output
//!  │   │   ├─ Stdout
//!  │   │   └─ Stderr
//!  │   └─ Exit
//!  └─ Custom(name)
//! ```
//!
//! The [`Event`] struct carries the source task (the current task when the event was built),
//! a timestamp, a global sequence number and the payload fields of its type.
//!
//! ## Example
//! ```rust
//! use taskloop::{Event, EventType, LogLevel};
//!
//! let ev = Event::log(LogLevel::Warning, "disk almost full");
//! assert_eq!(ev.kind, EventType::Log);
//! assert!(ev.kind.is_a(EventType::Any));
//! assert!(ev.source().is_err()); // built outside of any task
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use crate::core::{Task, TaskState, current_task_or_none};
use crate::error::{RuntimeError, TaskError, TaskInfo};
use crate::logging::LogLevel;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Supertype of every event.
    Any,

    /// Supertype of runtime instrumentation events.
    Debug,

    /// A task changed state.
    ///
    /// Sets:
    /// - `previous_state`: old state (`None` for the initial `preparing`)
    /// - `state`: new state
    StateChange,

    /// An abort of a related task reached a task.
    ///
    /// Sets:
    /// - `related`: the aborted task
    /// - `error`: the relationship-wrapped error
    /// - `handled`: whether an error handler received it
    ExceptionPropagation,

    /// The task loop received SIGINT.
    Interrupted,

    /// A log message.
    ///
    /// Sets:
    /// - `level`: severity
    /// - `message`: text
    Log,

    /// Supertype of process events.
    Process,

    /// Supertype of process output lines.
    Output,

    /// One line of standard output, including the trailing newline.
    ///
    /// Sets:
    /// - `message`: the line
    Stdout,

    /// One line of standard error, including the trailing newline.
    ///
    /// Sets:
    /// - `message`: the line
    Stderr,

    /// The process exited.
    ///
    /// Sets:
    /// - `returncode`: exit status, negative for termination by signal
    Exit,

    /// User-defined event type, a direct subtype of [`EventType::Any`].
    Custom(&'static str),
}

impl EventType {
    /// Direct supertype, `None` for [`EventType::Any`].
    pub fn parent(self) -> Option<EventType> {
        match self {
            EventType::Any => None,
            EventType::Debug
            | EventType::Interrupted
            | EventType::Log
            | EventType::Process
            | EventType::Custom(_) => Some(EventType::Any),
            EventType::StateChange | EventType::ExceptionPropagation => Some(EventType::Debug),
            EventType::Output | EventType::Exit => Some(EventType::Process),
            EventType::Stdout | EventType::Stderr => Some(EventType::Output),
        }
    }

    /// The type followed by all of its supertypes, ending with [`EventType::Any`].
    pub fn lineage(self) -> impl Iterator<Item = EventType> {
        std::iter::successors(Some(self), |ty| ty.parent())
    }

    /// `true` if `self` is `other` or one of its subtypes.
    pub fn is_a(self, other: EventType) -> bool {
        self.lineage().any(|ty| ty == other)
    }

    /// Short stable name.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Any => "any",
            EventType::Debug => "debug",
            EventType::StateChange => "state_change",
            EventType::ExceptionPropagation => "exception_propagation",
            EventType::Interrupted => "interrupted",
            EventType::Log => "log",
            EventType::Process => "process",
            EventType::Output => "output",
            EventType::Stdout => "stdout",
            EventType::Stderr => "stderr",
            EventType::Exit => "exit",
            EventType::Custom(name) => name,
        }
    }
}

/// Event emitted on a task's bus.
#[derive(Debug, Clone)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp of construction.
    pub at: SystemTime,
    /// Event type.
    pub kind: EventType,
    /// Previous state (state changes).
    pub previous_state: Option<TaskState>,
    /// New state (state changes).
    pub state: Option<TaskState>,
    /// Severity (log events).
    pub level: Option<LogLevel>,
    /// Log message or output line.
    pub message: Option<Arc<str>>,
    /// Process exit status.
    pub returncode: Option<i32>,
    /// Propagated error.
    pub error: Option<TaskError>,
    /// Whether a propagated error was handled.
    pub handled: Option<bool>,
    /// Related task (e.g. the aborted task of a propagation).
    pub related: Option<TaskInfo>,
    source: Option<Task>,
}

impl Event {
    /// Creates an event of `kind` whose source is the current task.
    pub fn new(kind: EventType) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            previous_state: None,
            state: None,
            level: None,
            message: None,
            returncode: None,
            error: None,
            handled: None,
            related: None,
            source: current_task_or_none(),
        }
    }

    /// Creates a user-defined event.
    pub fn custom(name: &'static str) -> Self {
        Self::new(EventType::Custom(name))
    }

    /// Creates a [`EventType::Log`] event.
    pub fn log(level: LogLevel, message: impl Into<Arc<str>>) -> Self {
        Self::new(EventType::Log).with_level(level).with_message(message)
    }

    /// Creates a [`EventType::StateChange`] event.
    pub fn state_change(previous: Option<TaskState>, state: TaskState) -> Self {
        let mut ev = Self::new(EventType::StateChange);
        ev.previous_state = previous;
        ev.state = Some(state);
        ev
    }

    /// Creates a [`EventType::ExceptionPropagation`] event.
    pub fn exception_propagation(related: TaskInfo, error: TaskError, handled: bool) -> Self {
        let mut ev = Self::new(EventType::ExceptionPropagation);
        ev.related = Some(related);
        ev.error = Some(error);
        ev.handled = Some(handled);
        ev
    }

    /// Creates a [`EventType::Interrupted`] event.
    pub fn interrupted() -> Self {
        Self::new(EventType::Interrupted)
    }

    /// Creates a [`EventType::Stdout`] event.
    pub fn stdout(line: impl Into<Arc<str>>) -> Self {
        Self::new(EventType::Stdout).with_message(line)
    }

    /// Creates a [`EventType::Stderr`] event.
    pub fn stderr(line: impl Into<Arc<str>>) -> Self {
        Self::new(EventType::Stderr).with_message(line)
    }

    /// Creates a [`EventType::Exit`] event.
    pub fn exit(returncode: i32) -> Self {
        let mut ev = Self::new(EventType::Exit);
        ev.returncode = Some(returncode);
        ev
    }

    /// Sets the log level.
    #[inline]
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = Some(level);
        self
    }

    /// Sets the message / output line.
    #[inline]
    pub fn with_message(mut self, message: impl Into<Arc<str>>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Sets the error.
    #[inline]
    pub fn with_error(mut self, error: TaskError) -> Self {
        self.error = Some(error);
        self
    }

    /// Sets the related task.
    #[inline]
    pub fn with_related(mut self, related: TaskInfo) -> Self {
        self.related = Some(related);
        self
    }

    /// The task that was current when the event was built.
    ///
    /// # Errors
    /// [`RuntimeError::NoCurrentTask`] if the event was built outside of any task.
    pub fn source(&self) -> Result<&Task, RuntimeError> {
        self.source.as_ref().ok_or(RuntimeError::NoCurrentTask)
    }

    /// The message, or an empty string.
    pub fn message_str(&self) -> &str {
        self.message.as_deref().unwrap_or("")
    }

    /// Emits the event on its source task's bus.
    ///
    /// Delivery walks from the source task up through its ancestors; at each level synchronous
    /// handlers run and streams receive the event, for the event's type and every supertype.
    ///
    /// # Errors
    /// [`RuntimeError::NoCurrentTask`] if the event has no source task.
    pub fn emit(self) -> Result<(), RuntimeError> {
        let source = self.source()?.clone();
        source.emit_event(&self);
        Ok(())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(task) => write!(f, "{}: ", task.path())?,
            None => f.write_str("<no task>: ")?,
        }
        match self.kind {
            EventType::StateChange => {
                let prev = self.previous_state.map_or("none", TaskState::as_str);
                let next = self.state.map_or("none", TaskState::as_str);
                write!(f, "{prev} -> {next}")
            }
            EventType::ExceptionPropagation => {
                let related = self.related.as_ref().map_or("<unknown>", |t| &*t.path);
                let handled = if self.handled == Some(true) { "handled" } else { "unhandled" };
                match &self.error {
                    Some(err) => write!(f, "{handled} {err} (from {related})"),
                    None => write!(f, "{handled} abort of {related}"),
                }
            }
            EventType::Log => {
                let level = self.level.unwrap_or_default();
                write!(f, "{}: {}", level.as_str(), self.message_str())
            }
            EventType::Stdout | EventType::Stderr => {
                write!(f, "{} {:?}", self.kind.as_str(), self.message_str())
            }
            EventType::Exit => match self.returncode {
                Some(code) => write!(f, "exit {code}"),
                None => f.write_str("exit"),
            },
            kind => f.write_str(kind.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lineage_ends_at_any() {
        let lineage: Vec<_> = EventType::Stdout.lineage().collect();
        assert_eq!(
            lineage,
            vec![EventType::Stdout, EventType::Output, EventType::Process, EventType::Any]
        );
        assert_eq!(EventType::Any.lineage().count(), 1);
    }

    #[test]
    fn test_is_a() {
        assert!(EventType::StateChange.is_a(EventType::Debug));
        assert!(EventType::Exit.is_a(EventType::Process));
        assert!(!EventType::Exit.is_a(EventType::Output));
        assert!(EventType::Custom("build").is_a(EventType::Any));
        assert!(!EventType::Log.is_a(EventType::Debug));
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let a = Event::custom("a");
        let b = Event::custom("b");
        assert!(b.seq > a.seq);
    }

    #[test]
    fn test_display_without_source() {
        let ev = Event::exit(3);
        assert_eq!(ev.to_string(), "<no task>: exit 3");
        assert!(matches!(ev.emit(), Err(RuntimeError::NoCurrentTask)));
    }
}
