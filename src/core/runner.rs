//! # Drive one lifetime of a task.
//!
//! [`task_main`] is the future spawned for every task (and again after each restart). It walks
//! the task through its states and calls the handler hooks; aborts arrive from outside by
//! resolving the task's completions and aborting this future.
//!
//! ## Flow
//! ```text
//! preparing ── on_prepare ──► pending ── started ──► running ── on_run ──► waiting
//!                                 ▲                                           │
//!              check_start (deps, parent, lease)          check_finish (children, background)
//!                                                                             ▼
//!                                                          finished ── release lease ──► done
//! ```
//!
//! ## Rules
//! - An error escaping a hook fails the task (a cancellation error cancels it).
//! - The initial `preparing` state change is emitted once, not again after a restart.
//! - Children created while running are re-checked once the task enters `running`.
//! - Cleanup runs exactly once per lifetime, on every exit path.

use crate::core::{Task, TaskState};
use crate::core::completion::Outcome;
use crate::error::TaskError;
use crate::events::Event;

/// Runs `task` until it is done or aborted, then cleans it up.
pub(crate) async fn task_main(task: Task) {
    if let Err(err) = lifecycle(&task).await {
        task.fail(err);
    }
    task.cleanup();
}

async fn lifecycle(task: &Task) -> Result<(), TaskError> {
    if task.restart_counter() == 0 && task.parent().is_some() {
        Event::state_change(None, TaskState::Preparing).emit()?;
    }

    let handler = task.handler();
    handler.on_prepare(task).await?;

    task.change_state(TaskState::Pending);
    task.check_start();
    if !matches!(task.started_cell().wait().await, Outcome::Done) {
        return Ok(());
    }

    task.change_state(TaskState::Running);
    for child in task.children() {
        child.check_start();
    }

    handler.on_run(task).await?;

    if !task.finished_cell().is_resolved() {
        task.change_state(TaskState::Waiting);
        task.check_finish();
    }
    if !matches!(task.finished_cell().wait().await, Outcome::Done) {
        return Ok(());
    }

    task.release_lease();
    task.change_state(TaskState::Done);
    Ok(())
}
