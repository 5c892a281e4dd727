//! Error types used by the task loop runtime and by tasks.
//!
//! This module defines two main error enums:
//!
//! - [`RuntimeError`]: misuse of the runtime itself (no current task, a second task loop,
//!   an operation in the wrong task state, unset context variables).
//! - [`TaskError`]: everything that flows through task hooks, error handlers and the
//!   `started`/`finished` awaitables.
//!
//! ## Abort taxonomy
//! ```text
//! aborted ─┬─ Failed / Cancelled                  the task itself
//!          ├─ DependencyFailed / DependencyCancelled   a dependency of the handling task
//!          ├─ ChildFailed / ChildCancelled        a child of the handling task
//!          └─ ParentFailed / ParentCancelled      cascade from an ancestor's abort
//! ```
//!
//! Causes are shared (`Arc`), so the same root failure reported at several levels of the tree
//! keeps a single identity. [`crate::log_exception`] uses that identity to render a failure once.
//!
//! Both types provide `as_label` (stable snake_case) and `as_message` helpers.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::core::TaskState;

/// Stable numeric task identity, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Snapshot of a task's identity carried inside errors and events.
///
/// Errors outlive the task tree (they are returned from `run_task_loop`), so they refer to tasks
/// by identity and path instead of holding the task itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    /// Identity of the task.
    pub id: TaskId,
    /// Dot-joined path from the root (root excluded).
    pub path: Arc<str>,
    /// `true` when the task is a direct child of the root task.
    pub top_level: bool,
}

impl TaskInfo {
    fn relation(&self) -> &'static str {
        if self.top_level { "Top-level" } else { "Child" }
    }
}

impl fmt::Display for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// # Errors produced by the runtime.
///
/// These represent invalid use of the runtime, not failures of user work.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// An operation needed an ambient current task but none was active.
    #[error("no task is currently active")]
    NoCurrentTask,

    /// An operation needed the task loop but none is running on this thread.
    #[error("no task loop is currently active")]
    NoTaskLoop,

    /// A second task loop was started while one is still running.
    #[error("a task loop is already installed")]
    AlreadyRunning,

    /// A task operation was attempted in a state where it is not allowed.
    #[error("cannot {action} task {task} in state {state}")]
    InvalidState {
        /// Path of the task.
        task: String,
        /// State the task was in.
        state: TaskState,
        /// Short description of the rejected operation.
        action: &'static str,
    },

    /// A context variable has neither an override in the task chain nor a default.
    #[error("Context variable {name} not set")]
    NotSet {
        /// `Group.field` name of the variable.
        name: String,
    },

    /// A context map key was removed or read while not visible from the task.
    #[error("key {key} not present in {name}")]
    KeyNotFound {
        /// `Group.field` name of the map.
        name: String,
        /// Debug rendering of the key.
        key: String,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use taskloop::RuntimeError;
    ///
    /// assert_eq!(RuntimeError::AlreadyRunning.as_label(), "runtime_already_running");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::NoCurrentTask => "runtime_no_current_task",
            RuntimeError::NoTaskLoop => "runtime_no_task_loop",
            RuntimeError::AlreadyRunning => "runtime_already_running",
            RuntimeError::InvalidState { .. } => "runtime_invalid_state",
            RuntimeError::NotSet { .. } => "runtime_context_not_set",
            RuntimeError::KeyNotFound { .. } => "runtime_context_key_not_found",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// # Errors flowing through tasks.
///
/// `Failed` and `Cancelled` describe the abort of a task itself and are what `started()` and
/// `finished()` resolve to. The relationship wrappers are what an error handler of a *related*
/// task receives. The remaining variants are leaf errors raised by user code.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    /// The task's prepare/run hook (or one of its background activities) raised.
    #[error("Task {task} failed")]
    Failed {
        /// The failed task.
        task: TaskInfo,
        /// What made it fail.
        #[source]
        cause: Arc<TaskError>,
    },

    /// The task was cancelled.
    #[error("Task {task} cancelled")]
    Cancelled {
        /// The cancelled task.
        task: TaskInfo,
        /// What cancelled it, if the cancellation was propagated.
        #[source]
        cause: Option<Arc<TaskError>>,
    },

    /// A dependency of the handling task failed.
    #[error("Dependency {task} failed")]
    DependencyFailed {
        /// The dependency.
        task: TaskInfo,
        /// The dependency's failure cause.
        #[source]
        cause: Arc<TaskError>,
    },

    /// A dependency of the handling task was cancelled.
    #[error("Dependency {task} cancelled")]
    DependencyCancelled {
        /// The dependency.
        task: TaskInfo,
        /// The dependency's cancellation cause.
        #[source]
        cause: Option<Arc<TaskError>>,
    },

    /// A child of the handling task failed.
    #[error("{} task {} failed", .task.relation(), .task)]
    ChildFailed {
        /// The child.
        task: TaskInfo,
        /// The child's failure cause.
        #[source]
        cause: Arc<TaskError>,
    },

    /// A child of the handling task was cancelled.
    #[error("{} task {} cancelled", .task.relation(), .task)]
    ChildCancelled {
        /// The child.
        task: TaskInfo,
        /// The child's cancellation cause.
        #[source]
        cause: Option<Arc<TaskError>>,
    },

    /// Cancellation cascading from a failed ancestor.
    #[error("Parent task {task} failed")]
    ParentFailed {
        /// The ancestor that failed.
        task: TaskInfo,
        /// The ancestor's failure cause.
        #[source]
        cause: Arc<TaskError>,
    },

    /// Cancellation cascading from a cancelled ancestor.
    #[error("Parent task {task} cancelled")]
    ParentCancelled {
        /// The ancestor that was cancelled.
        task: TaskInfo,
        /// The ancestor's cancellation cause.
        #[source]
        cause: Option<Arc<TaskError>>,
    },

    /// A supervised process exited with a non-zero return code.
    #[error("Command {command} returned non-zero exit status {returncode}")]
    NonZeroExit {
        /// Shell rendering of the command.
        command: String,
        /// Exit status, negative for termination by signal.
        returncode: i32,
    },

    /// An error that was already reported through the logging surface.
    #[error("{message}")]
    Logged {
        /// The logged message.
        message: Arc<str>,
        /// The error that was logged, if any.
        #[source]
        cause: Option<Arc<TaskError>>,
    },

    /// Plain error message raised by user code.
    #[error("{0}")]
    Message(Arc<str>),

    /// I/O failure.
    #[error("{0}")]
    Io(#[source] Arc<io::Error>),

    /// Arbitrary error converted from `anyhow`.
    #[error("{0:#}")]
    Other(Arc<anyhow::Error>),

    /// Misuse of the runtime.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl TaskError {
    /// Creates a [`TaskError::Message`].
    pub fn msg(message: impl Into<String>) -> Self {
        TaskError::Message(Arc::from(message.into()))
    }

    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use taskloop::TaskError;
    ///
    /// assert_eq!(TaskError::msg("boom").as_label(), "task_message");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Failed { .. } => "task_failed",
            TaskError::Cancelled { .. } => "task_cancelled",
            TaskError::DependencyFailed { .. } => "dependency_failed",
            TaskError::DependencyCancelled { .. } => "dependency_cancelled",
            TaskError::ChildFailed { .. } => "child_failed",
            TaskError::ChildCancelled { .. } => "child_cancelled",
            TaskError::ParentFailed { .. } => "parent_failed",
            TaskError::ParentCancelled { .. } => "parent_cancelled",
            TaskError::NonZeroExit { .. } => "process_non_zero_exit",
            TaskError::Logged { .. } => "task_logged",
            TaskError::Message(_) => "task_message",
            TaskError::Io(_) => "task_io",
            TaskError::Other(_) => "task_other",
            TaskError::Runtime(e) => e.as_label(),
        }
    }

    /// Returns a human-readable message including the cause chain.
    pub fn as_message(&self) -> String {
        let mut out = self.to_string();
        let mut next = self.cause();
        while let Some(cause) = next {
            out.push_str(": ");
            out.push_str(&cause.to_string());
            next = cause.cause();
        }
        out
    }

    /// `true` for every cancellation flavour (own, dependency, child, parent).
    ///
    /// A cancellation that escapes a hook cancels the task instead of failing it.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            TaskError::Cancelled { .. }
                | TaskError::DependencyCancelled { .. }
                | TaskError::ChildCancelled { .. }
                | TaskError::ParentCancelled { .. }
        )
    }

    /// `true` for every failure flavour (own, dependency, child, parent).
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TaskError::Failed { .. }
                | TaskError::DependencyFailed { .. }
                | TaskError::ChildFailed { .. }
                | TaskError::ParentFailed { .. }
        )
    }

    /// `true` for errors describing the abort of a task (any relationship).
    pub fn is_aborted(&self) -> bool {
        self.is_cancellation() || self.is_failure()
    }

    /// The task whose abort this error describes, if any.
    pub fn aborted_task(&self) -> Option<&TaskInfo> {
        match self {
            TaskError::Failed { task, .. }
            | TaskError::Cancelled { task, .. }
            | TaskError::DependencyFailed { task, .. }
            | TaskError::DependencyCancelled { task, .. }
            | TaskError::ChildFailed { task, .. }
            | TaskError::ChildCancelled { task, .. }
            | TaskError::ParentFailed { task, .. }
            | TaskError::ParentCancelled { task, .. } => Some(task),
            _ => None,
        }
    }

    /// The shared cause of this error, if any.
    pub fn cause(&self) -> Option<&Arc<TaskError>> {
        match self {
            TaskError::Failed { cause, .. }
            | TaskError::DependencyFailed { cause, .. }
            | TaskError::ChildFailed { cause, .. }
            | TaskError::ParentFailed { cause, .. } => Some(cause),
            TaskError::Cancelled { cause, .. }
            | TaskError::DependencyCancelled { cause, .. }
            | TaskError::ChildCancelled { cause, .. }
            | TaskError::ParentCancelled { cause, .. }
            | TaskError::Logged { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }
}

impl From<io::Error> for TaskError {
    fn from(err: io::Error) -> Self {
        TaskError::Io(Arc::new(err))
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::Other(Arc::new(err))
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        TaskError::Message(Arc::from(message))
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        TaskError::Message(Arc::from(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(path: &str, top_level: bool) -> TaskInfo {
        TaskInfo { id: TaskId(7), path: Arc::from(path), top_level }
    }

    #[test]
    fn test_child_messages_depend_on_level() {
        let cause = Arc::new(TaskError::msg("boom"));
        let top = TaskError::ChildFailed { task: info("build", true), cause: cause.clone() };
        let nested = TaskError::ChildCancelled { task: info("build.step", false), cause: None };

        assert_eq!(top.to_string(), "Top-level task build failed");
        assert_eq!(nested.to_string(), "Child task build.step cancelled");
    }

    #[test]
    fn test_as_message_walks_causes() {
        let leaf = Arc::new(TaskError::msg("disk full"));
        let failed = Arc::new(TaskError::Failed { task: info("write", true), cause: leaf });
        let err = TaskError::ChildFailed { task: info("write", true), cause: failed };

        assert_eq!(
            err.as_message(),
            "Top-level task write failed: Task write failed: disk full"
        );
    }

    #[test]
    fn test_classification() {
        let cancelled = TaskError::ParentCancelled { task: info("a", true), cause: None };
        assert!(cancelled.is_cancellation());
        assert!(!cancelled.is_failure());
        assert_eq!(cancelled.aborted_task().map(|t| &*t.path), Some("a"));

        let leaf = TaskError::from("plain");
        assert!(!leaf.is_aborted());
        assert!(leaf.aborted_task().is_none());
        assert_eq!(leaf.as_label(), "task_message");
    }

    #[test]
    fn test_anyhow_conversion_keeps_context() {
        let err: TaskError = anyhow::anyhow!("inner").context("outer").into();
        assert_eq!(err.to_string(), "outer: inner");
    }
}
