//! # Task loop.
//!
//! [`run_task_loop`] is the entry point of every program built on this crate. It owns a
//! single-threaded tokio runtime and a `LocalSet`, the root task, and the job-server client.
//!
//! ## Setup
//! ```text
//! run_task_loop_with(config, on_run)
//!   ├─ claim the process-wide slot (one loop at a time)
//!   ├─ runtime (current_thread) + LocalSet
//!   ├─ spawn the deferred callback driver
//!   ├─ Client::new(config) ──► PriorityScheduler ──► JobPriorities::SCHEDULER default
//!   ├─ root task ("root") whose run hook is `on_run`
//!   ├─ SIGINT watcher (optional)
//!   └─ await root.finished()
//! ```
//!
//! Log destinations registered by an earlier loop are dropped when a new loop starts.
//!
//! ## Teardown
//! The job-server client returns its tokens and stops the helper, every remaining spawned future
//! is dropped, the deferred queue and context defaults of this thread are cleared and the slot is
//! released, on every exit path.

use std::borrow::Cow;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::task::LocalSet;

use crate::config::Config;
use crate::context::reset_defaults;
use crate::core::{Task, deferred, shutdown};
use crate::error::{RuntimeError, TaskError};
use crate::jobs::{Client, JobPriorities, PriorityScheduler, Scheduler};
use crate::logging::{clear_root_destinations, forget_logged_errors};
use crate::tasks::TaskHandler;

static RUNNING: AtomicBool = AtomicBool::new(false);

struct LoopState {
    root: Task,
    client: Client,
}

thread_local! {
    static ACTIVE: RefCell<Option<LoopState>> = const { RefCell::new(None) };
}

/// `true` while a task loop runs on this thread.
pub(crate) fn is_active() -> bool {
    ACTIVE.with(|a| a.borrow().is_some())
}

/// The root task of the running loop.
///
/// # Errors
/// [`RuntimeError::NoTaskLoop`] outside of a task loop.
pub fn root_task() -> Result<Task, RuntimeError> {
    ACTIVE.with(|a| a.borrow().as_ref().map(|state| state.root.clone())).ok_or(RuntimeError::NoTaskLoop)
}

/// The job-server client of the running loop.
pub(crate) fn job_client() -> Result<Client, RuntimeError> {
    ACTIVE.with(|a| a.borrow().as_ref().map(|state| state.client.clone())).ok_or(RuntimeError::NoTaskLoop)
}

/// Runs a task loop with [`Config::from_env`].
///
/// See [`run_task_loop_with`].
pub fn run_task_loop<F, Fut>(on_run: F) -> Result<(), TaskError>
where
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = Result<(), TaskError>> + 'static,
{
    run_task_loop_with(Config::from_env(), on_run)
}

/// Runs a task loop until its root task finishes.
///
/// `on_run` becomes the run hook of the root task; tasks created inside it are top-level
/// tasks. The loop ends once the root and all of its children are finished.
///
/// # Errors
/// - [`RuntimeError::AlreadyRunning`] if another loop is running in this process
/// - the root's [`TaskError::Failed`] or [`TaskError::Cancelled`] if it was aborted
/// - [`TaskError::Io`] if the runtime or the job-server client could not be set up
///
/// # Example
/// ```no_run
/// use taskloop::{Config, Task, run_task_loop_with};
///
/// let config = Config { jobs: 4, ..Config::default() };
/// run_task_loop_with(config, || async {
///     let task = Task::from_fn(|_| async { Ok(()) })?;
///     task.finished().await
/// })
/// .expect("build failed");
/// ```
pub fn run_task_loop_with<F, Fut>(config: Config, on_run: F) -> Result<(), TaskError>
where
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = Result<(), TaskError>> + 'static,
{
    let _slot = LoopSlot::claim()?;
    clear_root_destinations();
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let local = LocalSet::new();
    let result = local.block_on(&runtime, run_root(config, on_run));

    if let Ok(client) = job_client() {
        client.shutdown();
    }
    {
        let _enter = runtime.enter();
        drop(local);
    }
    result
}

async fn run_root<F, Fut>(config: Config, on_run: F) -> Result<(), TaskError>
where
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = Result<(), TaskError>> + 'static,
{
    tokio::task::spawn_local(deferred::drive());

    let client = Client::new(&config)?;
    let scheduler: Rc<dyn Scheduler> = Rc::new(PriorityScheduler::new(Rc::new(client.clone())));
    JobPriorities::SCHEDULER.set(scheduler);

    let root = Task::root(Rc::new(RootHandler { on_run: RefCell::new(Some(on_run)) }));
    ACTIVE.with(|a| *a.borrow_mut() = Some(LoopState { root: root.clone(), client }));

    let interrupts = config.handle_sigint.then(|| {
        let weak = root.downgrade();
        tokio::task::spawn_local(async move {
            if let Err(err) = shutdown::watch_interrupts(weak).await {
                tracing::warn!(%err, "failed to install interrupt handler");
            }
        })
    });

    let result = root.finished().await;
    if let Some(watcher) = interrupts {
        watcher.abort();
    }
    result
}

struct RootHandler<F> {
    on_run: RefCell<Option<F>>,
}

#[async_trait(?Send)]
impl<F, Fut> TaskHandler for RootHandler<F>
where
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = Result<(), TaskError>> + 'static,
{
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("root")
    }

    async fn on_run(&self, _task: &Task) -> Result<(), TaskError> {
        let on_run = self.on_run.borrow_mut().take();
        match on_run {
            Some(on_run) => on_run().await,
            None => Ok(()),
        }
    }
}

/// Process-wide claim on the single task loop; releases it and clears per-thread state on drop.
struct LoopSlot(());

impl LoopSlot {
    fn claim() -> Result<LoopSlot, RuntimeError> {
        RUNNING
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| LoopSlot(()))
            .map_err(|_| RuntimeError::AlreadyRunning)
    }
}

impl Drop for LoopSlot {
    fn drop(&mut self) {
        let state = ACTIVE.with(|a| a.borrow_mut().take());
        drop(state);
        deferred::clear();
        reset_defaults();
        forget_logged_errors();
        RUNNING.store(false, Ordering::Release);
    }
}
