//! Runtime core: the task tree engine and the loop that drives it.
//!
//! The public API from this module is [`Task`] with its [`TaskState`], the ambient
//! current-task accessors and the task loop entry points.
//!
//! Internal modules:
//! - [`task`]: task tree nodes, dependencies, propagation of aborts, events and context slots;
//! - [`runner`]: drives one lifetime of a task through its hooks;
//! - [`task_loop`]: runtime, root task, job-server client and teardown;
//! - [`current`]: ambient current task;
//! - [`completion`]: one-shot `started`/`finished` cells;
//! - [`deferred`]: "call soon" queue for completion and lease callbacks;
//! - [`shutdown`]: SIGINT handling.

pub(crate) mod completion;
pub(crate) mod current;
pub(crate) mod deferred;
mod runner;
mod shutdown;
mod state;
mod task;
mod task_loop;

pub use current::{current_task, current_task_or_none};
pub use state::TaskState;
pub use task::{BackgroundOpts, FinishBlock, SyncHandlerRegistration, Task};
pub use task_loop::{root_task, run_task_loop, run_task_loop_with};

pub(crate) use task_loop::job_client;
