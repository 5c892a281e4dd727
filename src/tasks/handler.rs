//! # Lifecycle hooks of a task.
//!
//! A [`TaskHandler`] supplies the behaviour of a task; the engine owns the state machine and
//! calls the hooks at fixed points:
//!
//! ```text
//! create ── configure ── on_prepare ── (deps, parent, lease) ── on_run ── children ── done
//!                             │                                   │
//!                             └──────── cancel ── on_cancel ──────┴──► on_cleanup (always, once)
//! ```
//!
//! Every hook runs with the task as the current task.

use std::borrow::Cow;

use async_trait::async_trait;

use crate::core::Task;
use crate::error::TaskError;

/// # Behaviour of a task.
///
/// All hooks have empty defaults; implement the ones you need.
///
/// # Example
/// ```no_run
/// use async_trait::async_trait;
/// use taskloop::{Task, TaskError, TaskHandler};
///
/// struct Compile {
///     file: String,
/// }
///
/// #[async_trait(?Send)]
/// impl TaskHandler for Compile {
///     fn name(&self) -> std::borrow::Cow<'static, str> {
///         "compile".into()
///     }
///
///     async fn on_run(&self, _task: &Task) -> Result<(), TaskError> {
///         taskloop::log(format!("compiling {}", self.file));
///         Ok(())
///     }
/// }
/// ```
#[async_trait(?Send)]
pub trait TaskHandler: 'static {
    /// Default name of the task; made unique among siblings by the engine.
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("Task")
    }

    /// Runs once on creation, before the task is scheduled. Flags may be changed here.
    fn configure(&self, _task: &Task) {}

    /// Runs before the task becomes pending; dependencies are usually added here.
    async fn on_prepare(&self, _task: &Task) -> Result<(), TaskError> {
        Ok(())
    }

    /// The work of the task. Children created here keep the task waiting until they finish.
    async fn on_run(&self, _task: &Task) -> Result<(), TaskError> {
        Ok(())
    }

    /// Runs when the task is cancelled directly or through an ancestor.
    fn on_cancel(&self, _task: &Task) {}

    /// Runs exactly once per lifetime after the task finished, however it finished.
    fn on_cleanup(&self, _task: &Task) {}
}
