//! # taskloop
//!
//! **taskloop** runs trees of cooperatively scheduled tasks on a single thread.
//!
//! Tasks form a tree (every task is created as a child of the *current task*), may depend on
//! other tasks, publish events on a per-task bus, read context variables inherited through the
//! tree, and can hold a job lease that limits how many of them run at once. The lease limit is
//! shared with `make` and other cooperating processes through the make job-server protocol.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!                         run_task_loop(on_run)
//!                                  │
//!     ┌────────────────────────────▼─────────────────────────────────┐
//!     │  Task loop (current_thread runtime + LocalSet)               │
//!     │  - root task (runs `on_run`)                                 │
//!     │  - deferred callback queue                                   │
//!     │  - job-server Client ─► PriorityScheduler (default scheduler)│
//!     │  - SIGINT watcher                                            │
//!     └──────┬──────────────────┬──────────────────┬─────────────────┘
//!            ▼                  ▼                  ▼
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!     │  Task        │   │  TaskGroup   │   │  Process     │
//!     │ (TaskFn)     │   │ (children)   │   │ (subprocess) │
//!     └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!            │ events ▲         │ context ▲        │ lease ▲
//!            ▼        │         ▼         │        ▼       │
//!       Event bus (per task, bubbles to ancestors)   Lease scheduler
//! ```
//!
//! ### Lifecycle
//! ```text
//! preparing ── on_prepare ──► pending ── deps done, parent started, lease ──► running
//!    running ── on_run ──► waiting ── children, background work done ──► done
//!
//! any unfinished state ──► failed | cancelled | discarded
//!   - failed: a hook or background activity returned an error
//!   - cancelled: `cancel()` or an unhandled cancellation of a dependency/child
//!   - discarded: cancelled automatically (parent aborted, no dependents left)
//! ```
//!
//! An abort of a dependency or child reaches the related task as a wrapped error
//! ([`TaskError::DependencyFailed`], [`TaskError::ChildCancelled`], ...). An error handler
//! registered with [`Task::set_error_handler`] absorbs it; without one the related task aborts
//! too, up to the root. [`run_task_loop`] returns the root's error.
//!
//! ## Features
//! | Area              | Description                                                      | Key types / functions                         |
//! |-------------------|------------------------------------------------------------------|-----------------------------------------------|
//! | **Tasks**         | Task tree, dependencies, abort propagation, background activity  | [`Task`], [`TaskHandler`], [`TaskFn`], [`TaskGroup`] |
//! | **Events**        | Typed per-task bus with streams and synchronous handlers         | [`Event`], [`EventType`], [`EventStream`]     |
//! | **Context**       | Variables and maps inherited through the task tree               | [`ContextVar`], [`ContextMap`]                |
//! | **Jobs**          | Leases, make job server, priorities                              | [`Lease`], [`Client`], [`JobPriorities`]      |
//! | **Processes**     | Subprocesses in isolated process groups                          | [`Process`], [`ProcessContext`]               |
//! | **Logging**       | Log events, destinations, one-time error reports                 | [`log`], [`start_logging`], [`LogContext`]    |
//! | **Errors**        | Typed errors for tasks and runtime misuse                        | [`TaskError`], [`RuntimeError`]               |
//! | **Configuration** | Loop settings                                                    | [`Config`]                                    |
//!
//! ## Example
//! ```no_run
//! use taskloop::{LogDestination, Task, TaskError, log, run_task_loop, start_logging};
//!
//! fn main() -> Result<(), TaskError> {
//!     run_task_loop(|| async {
//!         start_logging(LogDestination::stderr(), None)?;
//!
//!         let fetch = Task::from_fn(|_| async {
//!             log("fetching");
//!             Ok(())
//!         })?;
//!         let build = Task::from_fn(|_| async {
//!             log("building");
//!             Ok(())
//!         })?;
//!         build.depends_on(&fetch)?;
//!         build.finished().await
//!     })
//! }
//! ```
mod config;
mod context;
mod core;
mod error;
mod events;
mod jobs;
mod logging;
mod process;
mod sys;
mod tasks;

// ---- Public re-exports ----

pub use config::Config;
pub use context::{ContextMap, ContextMapView, ContextVar, VarKey};
pub use core::{
    BackgroundOpts, FinishBlock, SyncHandlerRegistration, Task, TaskState, current_task, current_task_or_none,
    root_task, run_task_loop, run_task_loop_with,
};
pub use error::{RuntimeError, TaskError, TaskId, TaskInfo};
pub use events::{Event, EventStream, EventType};
pub use jobs::{
    Client, JobPriorities, JobServerMode, Lease, PriorityScheduler, Ready, Scheduler, SubprocessSetup,
    init_job_server_environment,
};
pub use logging::{
    LogContext, LogDestination, LogFormatter, LogLevel, TimeFormatter, default_log_format, default_time_format,
    install_root_error_handler, log, log_at, log_debug, log_error, log_exception, log_warning,
    start_debug_event_logging, start_logging,
};
pub use process::{Process, ProcessBuilder, ProcessContext, isolate_in_process_group};
pub use tasks::{TaskBuilder, TaskFn, TaskGroup, TaskHandler};
