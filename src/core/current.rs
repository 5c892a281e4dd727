//! # Ambient current task.
//!
//! Every operation that needs a caller identity (creating children, emitting events, reading
//! context variables, logging) reads the *current task* instead of taking it as an argument.
//!
//! The current task is a tokio task-local: each task's main future and its background futures
//! run inside a scope for that task, and [`Task::as_current_task`] installs a synchronous scope
//! that is restored on every exit path, unwinding included.
//!
//! Synchronous event handlers run in frames tracked by a per-thread depth counter; aborting the
//! task that is currently executing is postponed until the outermost frame has returned.

use std::cell::{Cell, RefCell};
use std::future::Future;

use tokio::task::AbortHandle;

use crate::core::Task;
use crate::error::RuntimeError;

tokio::task_local! {
    static CURRENT: Task;
}

thread_local! {
    static SYNC_DEPTH: Cell<usize> = const { Cell::new(0) };
    static DEFERRED_ABORTS: RefCell<Vec<AbortHandle>> = const { RefCell::new(Vec::new()) };
}

/// Returns the current task.
///
/// # Errors
/// [`RuntimeError::NoCurrentTask`] outside of any task.
pub fn current_task() -> Result<Task, RuntimeError> {
    CURRENT.try_with(Task::clone).map_err(|_| RuntimeError::NoCurrentTask)
}

/// Returns the current task, or `None` outside of any task.
pub fn current_task_or_none() -> Option<Task> {
    CURRENT.try_with(Task::clone).ok()
}

/// Runs `f` with `task` as the current task.
pub(crate) fn with_current<R>(task: &Task, f: impl FnOnce() -> R) -> R {
    CURRENT.sync_scope(task.clone(), f)
}

/// Wraps `fut` so that `task` is current whenever it is polled.
pub(crate) fn scoped<F: Future>(task: Task, fut: F) -> impl Future<Output = F::Output> {
    CURRENT.scope(task, fut)
}

/// Marks a synchronous handler frame for its lifetime.
pub(crate) struct SyncFrame(());

impl SyncFrame {
    pub(crate) fn enter() -> Self {
        SYNC_DEPTH.with(|d| d.set(d.get() + 1));
        SyncFrame(())
    }
}

impl Drop for SyncFrame {
    fn drop(&mut self) {
        let depth = SYNC_DEPTH.with(|d| {
            let depth = d.get().saturating_sub(1);
            d.set(depth);
            depth
        });
        if depth == 0 {
            let pending = DEFERRED_ABORTS.with(|a| std::mem::take(&mut *a.borrow_mut()));
            for handle in pending {
                handle.abort();
            }
        }
    }
}

/// Aborts a spawned task, postponing self-aborts issued from inside a synchronous handler.
pub(crate) fn abort(handle: AbortHandle) {
    let in_handler = SYNC_DEPTH.with(Cell::get) > 0;
    let is_self = tokio::task::try_id() == Some(handle.id());
    if in_handler && is_self {
        DEFERRED_ABORTS.with(|a| a.borrow_mut().push(handle));
    } else {
        handle.abort();
    }
}
