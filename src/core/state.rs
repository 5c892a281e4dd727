//! # Task lifecycle states.
//!
//! ```text
//! preparing ──► pending ──► running ──► waiting ──► done
//!     │            │           │           │
//!     └────────────┴───────────┴───────────┴──► failed | cancelled | discarded
//! ```
//!
//! ## Rules
//! - States only move forward; `preparing` is re-entered only by an explicit restart.
//! - `done`, `failed`, `cancelled` and `discarded` are terminal.
//! - `cancelled` and `discarded` are both "aborted"; the split exists for diagnostics.

use std::fmt;

/// State of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Created, running its prepare hook.
    Preparing,
    /// Waiting for dependencies, the parent, or a lease.
    Pending,
    /// Running its run hook.
    Running,
    /// Run hook finished, waiting for children, background work or finish blockers.
    Waiting,
    /// Finished successfully.
    Done,
    /// Finished with an unhandled error.
    Failed,
    /// Cancelled directly or by propagation.
    Cancelled,
    /// Cancelled automatically (unneeded dependency, or caught in a parent's abort).
    Discarded,
}

impl TaskState {
    /// Returns the lowercase state name.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Preparing => "preparing",
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Waiting => "waiting",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Discarded => "discarded",
        }
    }

    /// `true` for the four terminal states.
    #[inline]
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Failed | TaskState::Cancelled | TaskState::Discarded
        )
    }

    /// `true` for `failed`, `cancelled` and `discarded`.
    #[inline]
    pub fn is_aborted(self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Cancelled | TaskState::Discarded)
    }

    /// `true` while the task may still produce a completion (tracked by parents and dependents).
    #[inline]
    pub(crate) fn is_unfinished(self) -> bool {
        !self.is_finished()
    }

    /// `true` before the task has started running.
    #[inline]
    pub(crate) fn is_before_start(self) -> bool {
        matches!(self, TaskState::Preparing | TaskState::Pending)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
