//! # Task tree node.
//!
//! A [`Task`] is a cheap, reference-counted handle to one node of the task tree. The node owns
//! the state machine, the parent/child and dependency graphs, the per-task event bus tails,
//! context overrides and the task's lease.
//!
//! ## Graph
//! ```text
//!             parent (weak)
//!                  ▲
//!   dependency ◄── task ──► children (strong)
//!   (strong)       │
//!                  └── reverse dependencies (weak): who still waits on this task
//! ```
//!
//! ## Completion callbacks
//! Dependencies and children notify through their `finished` completion. Each callback carries
//! the restart counter of the lifetime it was registered for; a callback for a lifetime that
//! already ended is ignored.
//!
//! ## Borrowing
//! Node state sits behind a `RefCell`. No borrow is held while user hooks, handlers, other
//! tasks or schedulers are called; values are taken out first.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::{AbortHandle, JoinHandle};

use crate::context::{Slot, VarKey};
use crate::core::completion::{Completion, Outcome};
use crate::core::current::{self, SyncFrame, current_task, with_current};
use crate::core::{TaskState, deferred, runner, task_loop};
use crate::error::{RuntimeError, TaskError, TaskId, TaskInfo};
use crate::events::{Cell, Event, EventStream, EventType};
use crate::jobs::{JobPriorities, Lease};
use crate::tasks::{TaskBuilder, TaskHandler};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

type ErrorHandler = Rc<dyn Fn(TaskError) -> Result<(), TaskError>>;
type SyncHandler = Rc<dyn Fn(&Event)>;

/// Options for [`Task::background`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BackgroundOpts {
    /// Keep the task from finishing until the activity ends.
    pub wait: bool,
    /// The activity handles an error; it may be started for a finished task.
    pub error_handler: bool,
}

#[derive(Clone, Copy)]
enum Relation {
    Dependency,
    Child,
}

impl Relation {
    fn failed(self, task: TaskInfo, cause: Arc<TaskError>) -> TaskError {
        match self {
            Relation::Dependency => TaskError::DependencyFailed { task, cause },
            Relation::Child => TaskError::ChildFailed { task, cause },
        }
    }

    fn cancelled(self, task: TaskInfo, cause: Option<Arc<TaskError>>) -> TaskError {
        match self {
            Relation::Dependency => TaskError::DependencyCancelled { task, cause },
            Relation::Child => TaskError::ChildCancelled { task, cause },
        }
    }
}

struct TaskCore {
    name: String,
    state: TaskState,

    children: Vec<Task>,
    child_names: HashSet<String>,
    pending_children: Vec<(Task, u64)>,

    dependencies: Vec<Task>,
    pending_deps: Vec<(Task, u64)>,
    reverse_deps: Vec<WeakTask>,

    error_handlers: HashMap<Option<TaskId>, ErrorHandler>,

    use_lease: bool,
    lease: Option<Lease>,
    discard: bool,
    restart_on_new_children: bool,
    restart_counter: u64,

    started: Completion,
    finished: Completion,
    cleaned_up: bool,
    block_finish: usize,

    background: HashMap<u64, AbortHandle>,
    wait_background: HashMap<u64, AbortHandle>,
    next_background: u64,

    cancellation_cause: Option<Arc<TaskError>>,
    cancelled_by: Option<WeakTask>,

    sync_handlers: HashMap<EventType, Vec<(u64, SyncHandler)>>,
    next_handler: u64,
    cursors: HashMap<EventType, Rc<Cell>>,

    context: HashMap<VarKey, Slot>,
    main: Option<AbortHandle>,
}

impl TaskCore {
    fn new() -> Self {
        Self {
            name: String::new(),
            state: TaskState::Preparing,
            children: Vec::new(),
            child_names: HashSet::new(),
            pending_children: Vec::new(),
            dependencies: Vec::new(),
            pending_deps: Vec::new(),
            reverse_deps: Vec::new(),
            error_handlers: HashMap::new(),
            use_lease: false,
            lease: None,
            discard: true,
            restart_on_new_children: false,
            restart_counter: 0,
            started: Completion::new(),
            finished: Completion::new(),
            cleaned_up: false,
            block_finish: 0,
            background: HashMap::new(),
            wait_background: HashMap::new(),
            next_background: 0,
            cancellation_cause: None,
            cancelled_by: None,
            sync_handlers: HashMap::new(),
            next_handler: 0,
            cursors: HashMap::new(),
            context: HashMap::new(),
            main: None,
        }
    }
}

pub(crate) struct TaskInner {
    id: TaskId,
    parent: Option<Weak<TaskInner>>,
    handler: Rc<dyn TaskHandler>,
    core: RefCell<TaskCore>,
}

/// Handle to a node of the task tree.
///
/// Clones refer to the same task; equality is identity.
#[derive(Clone)]
pub struct Task(Rc<TaskInner>);

/// Non-owning task reference.
#[derive(Clone)]
pub(crate) struct WeakTask(Weak<TaskInner>);

impl WeakTask {
    pub(crate) fn upgrade(&self) -> Option<Task> {
        self.0.upgrade().map(Task)
    }

    fn is(&self, task: &Task) -> bool {
        std::ptr::eq(self.0.as_ptr(), Rc::as_ptr(&task.0))
    }
}

impl Task {
    fn alloc(parent: Option<&Task>, handler: Rc<dyn TaskHandler>) -> Task {
        Task(Rc::new(TaskInner {
            id: TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)),
            parent: parent.map(|p| Rc::downgrade(&p.0)),
            handler,
            core: RefCell::new(TaskCore::new()),
        }))
    }

    /// Creates a task with `handler` as a child of the current task.
    ///
    /// # Errors
    /// See [`TaskBuilder::build`].
    pub fn new<H: TaskHandler>(handler: H) -> Result<Task, RuntimeError> {
        TaskBuilder::new().build(handler)
    }

    /// Creates a task running `f` as a child of the current task.
    pub fn from_fn<F, Fut>(f: F) -> Result<Task, RuntimeError>
    where
        F: Fn(Task) -> Fut + 'static,
        Fut: Future<Output = Result<(), TaskError>> + 'static,
    {
        TaskBuilder::new().build_fn(f)
    }

    pub(crate) fn create(handler: Rc<dyn TaskHandler>, options: TaskBuilder) -> Result<Task, RuntimeError> {
        if !task_loop::is_active() {
            return Err(RuntimeError::NoTaskLoop);
        }
        let parent = current_task()?;
        let task = Task::alloc(Some(&parent), handler.clone());
        parent.add_child(&task)?;
        let name = options.name.clone().unwrap_or_else(|| handler.name());
        task.assign_name(&name);

        with_current(&task, || handler.configure(&task));
        {
            let mut core = task.0.core.borrow_mut();
            if let Some(use_lease) = options.use_lease {
                core.use_lease = use_lease;
            }
            if let Some(discard) = options.discard {
                core.discard = discard;
            }
            if let Some(restart) = options.restart_on_new_children {
                core.restart_on_new_children = restart;
            }
        }
        task.spawn_main();
        Ok(task)
    }

    pub(crate) fn root(handler: Rc<dyn TaskHandler>) -> Task {
        let task = Task::alloc(None, handler.clone());
        with_current(&task, || handler.configure(&task));
        task.assign_name("root");
        task.spawn_main();
        task
    }

    fn spawn_main(&self) {
        let main = current::scoped(self.clone(), runner::task_main(self.clone()));
        let handle = tokio::task::spawn_local(main);
        self.0.core.borrow_mut().main = Some(handle.abort_handle());
    }

    pub(crate) fn downgrade(&self) -> WeakTask {
        WeakTask(Rc::downgrade(&self.0))
    }

    pub(crate) fn handler(&self) -> Rc<dyn TaskHandler> {
        self.0.handler.clone()
    }

    // ---- Identity and tree ----

    #[inline]
    pub fn id(&self) -> TaskId {
        self.0.id
    }

    pub fn name(&self) -> String {
        self.0.core.borrow().name.clone()
    }

    /// Renames the task, keeping names unique among siblings (`name#1`, `name#2`, ...).
    pub fn set_name(&self, name: &str) {
        self.assign_name(name);
    }

    fn assign_name(&self, name: &str) {
        let Some(parent) = self.parent() else {
            self.0.core.borrow_mut().name = name.to_string();
            return;
        };
        let mut siblings = parent.0.core.borrow_mut();
        let old = std::mem::take(&mut self.0.core.borrow_mut().name);
        if !old.is_empty() {
            siblings.child_names.remove(&old);
        }
        let unique = if siblings.child_names.contains(name) {
            (1..)
                .map(|i| format!("{name}#{i}"))
                .find(|candidate| !siblings.child_names.contains(candidate))
                .unwrap_or_default()
        } else {
            name.to_string()
        };
        siblings.child_names.insert(unique.clone());
        self.0.core.borrow_mut().name = unique;
    }

    /// Dot-joined names from the top-level ancestor down to this task.
    pub fn path(&self) -> String {
        match self.parent() {
            Some(parent) if parent.parent().is_some() => format!("{}.{}", parent.path(), self.name()),
            _ => self.name(),
        }
    }

    /// Identity snapshot used in errors and events.
    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id(),
            path: Arc::from(self.path()),
            top_level: self.parent().and_then(|p| p.parent()).is_none(),
        }
    }

    pub fn parent(&self) -> Option<Task> {
        self.0.parent.as_ref().and_then(Weak::upgrade).map(Task)
    }

    pub fn children(&self) -> Vec<Task> {
        self.0.core.borrow().children.clone()
    }

    pub fn dependencies(&self) -> Vec<Task> {
        self.0.core.borrow().dependencies.clone()
    }

    // ---- State ----

    pub fn state(&self) -> TaskState {
        self.0.core.borrow().state
    }

    /// Done, failed, cancelled or discarded.
    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    pub fn is_done(&self) -> bool {
        self.state() == TaskState::Done
    }

    /// Failed, cancelled or discarded.
    pub fn is_aborted(&self) -> bool {
        self.state().is_aborted()
    }

    /// How often the task was restarted by a new child.
    pub fn restart_counter(&self) -> u64 {
        self.0.core.borrow().restart_counter
    }

    pub fn use_lease(&self) -> bool {
        self.0.core.borrow().use_lease
    }

    pub fn discard(&self) -> bool {
        self.0.core.borrow().discard
    }

    pub fn restart_on_new_children(&self) -> bool {
        self.0.core.borrow().restart_on_new_children
    }

    /// Acquire a job lease before running. Only while preparing.
    pub fn set_use_lease(&self, use_lease: bool) -> Result<(), RuntimeError> {
        self.ensure_preparing("change lease usage of")?;
        self.0.core.borrow_mut().use_lease = use_lease;
        Ok(())
    }

    /// Cancel the task once nothing depends on it anymore. Only while preparing.
    pub fn set_discard(&self, discard: bool) -> Result<(), RuntimeError> {
        self.ensure_preparing("change discard flag of")?;
        self.0.core.borrow_mut().discard = discard;
        Ok(())
    }

    /// Reopen the finished task when a child is added. Only while preparing.
    pub fn set_restart_on_new_children(&self, restart: bool) -> Result<(), RuntimeError> {
        self.ensure_preparing("change restart flag of")?;
        self.0.core.borrow_mut().restart_on_new_children = restart;
        Ok(())
    }

    pub(crate) fn configure_flags(&self, discard: Option<bool>, restart_on_new_children: Option<bool>) {
        let mut core = self.0.core.borrow_mut();
        if let Some(discard) = discard {
            core.discard = discard;
        }
        if let Some(restart) = restart_on_new_children {
            core.restart_on_new_children = restart;
        }
    }

    fn ensure_preparing(&self, action: &'static str) -> Result<(), RuntimeError> {
        let state = self.state();
        if state == TaskState::Preparing {
            Ok(())
        } else {
            Err(self.invalid_state(state, action))
        }
    }

    fn invalid_state(&self, state: TaskState, action: &'static str) -> RuntimeError {
        RuntimeError::InvalidState { task: self.path(), state, action }
    }

    pub(crate) fn change_state(&self, state: TaskState) {
        let old = {
            let mut core = self.0.core.borrow_mut();
            let old = core.state;
            let restarting = old == TaskState::Done && state == TaskState::Preparing;
            if old == state || (old.is_finished() && !restarting) {
                return;
            }
            core.state = state;
            old
        };
        if self.0.parent.is_some() {
            self.emit_as_self(|| Event::state_change(Some(old), state));
        }
    }

    // ---- Completion ----

    pub(crate) fn started_cell(&self) -> Completion {
        self.0.core.borrow().started.clone()
    }

    pub(crate) fn finished_cell(&self) -> Completion {
        self.0.core.borrow().finished.clone()
    }

    /// Resolves once the task started running; `Err` if it was aborted before.
    pub fn started(&self) -> impl Future<Output = Result<(), TaskError>> + 'static {
        let cell = self.started_cell();
        let task = self.clone();
        async move { task.outcome_result(cell.wait().await) }
    }

    /// Resolves once the task finished; `Err` with [`TaskError::Failed`] or
    /// [`TaskError::Cancelled`] if it was aborted.
    pub fn finished(&self) -> impl Future<Output = Result<(), TaskError>> + 'static {
        let cell = self.finished_cell();
        let task = self.clone();
        async move { task.outcome_result(cell.wait().await) }
    }

    fn outcome_result(&self, outcome: Outcome) -> Result<(), TaskError> {
        match outcome {
            Outcome::Done => Ok(()),
            Outcome::Failed(err) => Err(err),
            Outcome::Cancelled => Err(TaskError::Cancelled { task: self.info(), cause: self.cancellation_cause() }),
        }
    }

    pub(crate) fn cancellation_cause(&self) -> Option<Arc<TaskError>> {
        self.0.core.borrow().cancellation_cause.clone()
    }

    // ---- Children and dependencies ----

    fn add_child(&self, child: &Task) -> Result<(), RuntimeError> {
        let (state, restart) = {
            let core = self.0.core.borrow();
            (core.state, core.restart_on_new_children)
        };
        if state == TaskState::Done && restart {
            self.restart()?;
        } else if !state.is_unfinished() {
            return Err(self.invalid_state(state, "add a child to"));
        }

        let counter = child.restart_counter();
        let watch = !child.is_finished();
        let callback = watch.then(|| {
            let parent = self.downgrade();
            let watched = child.downgrade();
            child.finished_cell().on_resolved(move |outcome| {
                if let (Some(parent), Some(child)) = (parent.upgrade(), watched.upgrade()) {
                    parent.child_finished(&child, counter, outcome);
                }
            })
        });

        // A restarted child replaces the entry of its previous lifetime.
        if let Some(previous) = self.take_pending(Relation::Child, child) {
            child.finished_cell().remove_callback(previous);
        }
        let mut core = self.0.core.borrow_mut();
        if !core.children.contains(child) {
            core.children.push(child.clone());
        }
        if let Some(id) = callback {
            core.pending_children.push((child.clone(), id));
        }
        Ok(())
    }

    /// Makes this task wait for `other` before it starts.
    ///
    /// A dependency that already finished successfully is satisfied immediately; one that was
    /// already aborted is propagated on the next turn of the loop.
    ///
    /// # Errors
    /// [`RuntimeError::InvalidState`] once the task has started.
    pub fn depends_on(&self, other: &Task) -> Result<(), RuntimeError> {
        let state = self.state();
        if !state.is_before_start() {
            return Err(self.invalid_state(state, "add dependencies to"));
        }
        {
            let mut core = self.0.core.borrow_mut();
            if !core.dependencies.contains(other) {
                core.dependencies.push(other.clone());
            }
        }
        if other.is_done() {
            return Ok(());
        }

        let counter = other.restart_counter();
        let me = self.downgrade();
        let dep = other.downgrade();
        let id = other.finished_cell().on_resolved(move |outcome| {
            if let (Some(me), Some(dep)) = (me.upgrade(), dep.upgrade()) {
                me.dependency_finished(&dep, counter, outcome);
            }
        });
        if let Some(previous) = self.take_pending(Relation::Dependency, other) {
            other.finished_cell().remove_callback(previous);
        }
        self.0.core.borrow_mut().pending_deps.push((other.clone(), id));
        let mut dep_core = other.0.core.borrow_mut();
        if !dep_core.reverse_deps.iter().any(|w| w.is(self)) {
            dep_core.reverse_deps.push(self.downgrade());
        }
        Ok(())
    }

    fn take_pending(&self, relation: Relation, task: &Task) -> Option<u64> {
        let mut core = self.0.core.borrow_mut();
        let pending = match relation {
            Relation::Dependency => &mut core.pending_deps,
            Relation::Child => &mut core.pending_children,
        };
        let pos = pending.iter().position(|(t, _)| t == task)?;
        Some(pending.remove(pos).1)
    }

    fn has_reverse_dependency(&self, task: &Task) -> bool {
        self.0.core.borrow().reverse_deps.iter().any(|w| w.is(task))
    }

    fn dependency_finished(&self, dep: &Task, counter: u64, outcome: Outcome) {
        if dep.restart_counter() == counter {
            if self.take_pending(Relation::Dependency, dep).is_none() {
                return;
            }
            self.propagate_failure(dep, Relation::Dependency, outcome);
            self.check_start();
        } else if dep.has_reverse_dependency(self) {
            // Restarted and depended on again; the new lifetime notifies separately.
        } else if self.take_pending(Relation::Dependency, dep).is_some() {
            self.check_start();
        }
    }

    fn child_finished(&self, child: &Task, counter: u64, outcome: Outcome) {
        if child.restart_counter() != counter {
            return;
        }
        if self.take_pending(Relation::Child, child).is_none() {
            return;
        }
        self.propagate_failure(child, Relation::Child, outcome);
        self.check_finish();
    }

    // ---- Error handlers ----

    /// Registers `handler` for aborts of `task` (or, with `None`, of any related task).
    ///
    /// A handler absorbs the abort; returning an error fails this task instead.
    pub fn set_error_handler(
        &self,
        task: Option<&Task>,
        handler: impl Fn(TaskError) -> Result<(), TaskError> + 'static,
    ) {
        self.0.core.borrow_mut().error_handlers.insert(task.map(Task::id), Rc::new(handler));
    }

    /// Registers `handler` on the current task for aborts of this task.
    pub fn handle_error(
        &self,
        handler: impl Fn(TaskError) -> Result<(), TaskError> + 'static,
    ) -> Result<(), RuntimeError> {
        current_task()?.set_error_handler(Some(self), handler);
        Ok(())
    }

    fn propagate_failure(&self, task: &Task, relation: Relation, outcome: Outcome) {
        let error = match outcome {
            Outcome::Done => return,
            Outcome::Failed(err) => {
                let cause = err.cause().cloned().unwrap_or_else(|| Arc::new(err.clone()));
                relation.failed(task.info(), cause)
            }
            Outcome::Cancelled => relation.cancelled(task.info(), task.cancellation_cause()),
        };

        let handler = {
            let core = self.0.core.borrow();
            core.error_handlers.get(&Some(task.id())).or_else(|| core.error_handlers.get(&None)).cloned()
        };

        let info = task.info();
        let handled = handler.is_some();
        let propagated = error.clone();
        self.emit_as_self(move || Event::exception_propagation(info, propagated, handled));

        if let Some(handler) = handler {
            if let Err(err) = with_current(self, || handler(error)) {
                self.fail(err);
            }
            return;
        }
        if error.is_cancellation() {
            self.discard_via(task, error);
        } else {
            self.fail(error);
        }
    }

    // ---- Scheduling ----

    pub(crate) fn check_start(&self) {
        if self.state() != TaskState::Pending {
            return;
        }
        if self.parent().is_some_and(|p| p.state().is_before_start()) {
            return;
        }
        if !self.0.core.borrow().pending_deps.is_empty() {
            let lease = self.0.core.borrow_mut().lease.take();
            drop(lease);
            return;
        }
        if self.use_lease() {
            let has_lease = self.0.core.borrow().lease.is_some();
            if !has_lease {
                let scheduler = match with_current(self, || JobPriorities::SCHEDULER.get()) {
                    Ok(scheduler) => scheduler,
                    Err(err) => {
                        self.fail(err.into());
                        return;
                    }
                };
                let lease = with_current(self, || scheduler.request_lease());
                self.0.core.borrow_mut().lease = Some(lease);
            }
            let core = self.0.core.borrow();
            if let Some(lease) = core.lease.as_ref().filter(|l| !l.is_ready()) {
                let me = self.downgrade();
                lease.add_ready_callback(move || {
                    if let Some(me) = me.upgrade() {
                        me.check_start();
                    }
                });
                return;
            }
        }
        self.started_cell().resolve(Outcome::Done);
    }

    pub(crate) fn check_finish(&self) {
        let ready = {
            let core = self.0.core.borrow();
            core.state == TaskState::Waiting
                && core.pending_children.is_empty()
                && core.wait_background.is_empty()
                && core.block_finish == 0
        };
        if ready {
            self.finished_cell().resolve(Outcome::Done);
        }
    }

    pub(crate) fn release_lease(&self) {
        let lease = self.0.core.borrow_mut().lease.take();
        drop(lease);
    }

    fn restart(&self) -> Result<(), RuntimeError> {
        {
            let mut core = self.0.core.borrow_mut();
            core.restart_counter += 1;
            core.started = Completion::new();
            core.finished = Completion::new();
            core.cleaned_up = false;
            core.reverse_deps.clear();
        }
        tracing::debug!(task = %self.path(), "restarting task for a new child");
        self.change_state(TaskState::Preparing);
        if let Some(parent) = self.parent() {
            parent.add_child(self)?;
        }
        self.spawn_main();
        Ok(())
    }

    // ---- Abort ----

    /// Cancels the task and, with it, all of its children.
    ///
    /// Dependents without an error handler are cancelled in turn, except the task calling
    /// `cancel`.
    pub fn cancel(&self) {
        self.0.core.borrow_mut().cancelled_by = current::current_task_or_none().map(|t| t.downgrade());
        self.cancel_inner(false, None);
    }

    fn discard_via(&self, task: &Task, cause: TaskError) {
        let by_self = task.0.core.borrow().cancelled_by.as_ref().is_some_and(|w| w.is(self));
        if by_self {
            return;
        }
        self.cancel_inner(true, Some(cause));
    }

    pub(crate) fn cancel_inner(&self, discard: bool, cause: Option<TaskError>) {
        if self.is_finished() {
            return;
        }
        let cause = cause.map(Arc::new);
        self.0.core.borrow_mut().cancellation_cause = cause.clone();
        self.started_cell().resolve(Outcome::Cancelled);
        self.finished_cell().resolve(Outcome::Cancelled);
        self.change_state(if discard { TaskState::Discarded } else { TaskState::Cancelled });

        let children = self.children();
        if !children.is_empty() {
            let cascade = TaskError::ParentCancelled { task: self.info(), cause };
            for child in children {
                child.cancel_inner(true, Some(cascade.clone()));
            }
        }

        with_current(self, || self.0.handler.on_cancel(self));
        self.cleanup();
    }

    /// Marks the task failed with `err`; a cancellation error cancels it instead.
    pub(crate) fn fail(&self, err: TaskError) {
        if self.is_finished() {
            return;
        }
        if err.is_cancellation() {
            self.cancel_inner(false, Some(err));
            return;
        }

        tracing::debug!(task = %self.path(), error = %err.as_message(), "task failed");
        self.release_lease();
        let cause = Arc::new(err);
        let failed = TaskError::Failed { task: self.info(), cause: cause.clone() };
        self.started_cell().resolve(Outcome::Failed(failed.clone()));
        self.finished_cell().resolve(Outcome::Failed(failed));
        self.change_state(TaskState::Failed);

        let children = self.children();
        if !children.is_empty() {
            let cascade = TaskError::ParentFailed { task: self.info(), cause };
            for child in children {
                child.cancel_inner(true, Some(cascade.clone()));
            }
        }
        self.cleanup();
    }

    pub(crate) fn cleanup(&self) {
        if std::mem::replace(&mut self.0.core.borrow_mut().cleaned_up, true) {
            return;
        }
        with_current(self, || self.0.handler.on_cleanup(self));
        self.release_lease();

        let (children, deps, background, cursors, main) = {
            let mut core = self.0.core.borrow_mut();
            let mut background: Vec<AbortHandle> = core.background.drain().map(|(_, h)| h).collect();
            background.extend(core.wait_background.drain().map(|(_, h)| h));
            (
                std::mem::take(&mut core.pending_children),
                std::mem::take(&mut core.pending_deps),
                background,
                std::mem::take(&mut core.cursors),
                core.main.take(),
            )
        };

        for (child, id) in children {
            child.finished_cell().remove_callback(id);
        }
        for (dep, id) in deps {
            dep.finished_cell().remove_callback(id);
            let orphaned = {
                let mut dep_core = dep.0.core.borrow_mut();
                dep_core.reverse_deps.retain(|w| !w.is(self) && w.upgrade().is_some());
                dep_core.reverse_deps.is_empty() && dep_core.discard
            };
            if orphaned {
                deferred::defer(move || dep.cancel_inner(true, None));
            }
        }
        for handle in background {
            handle.abort();
        }
        for cell in cursors.into_values() {
            cell.close();
        }
        if let Some(main) = main {
            current::abort(main);
        }
    }

    // ---- Background activity ----

    /// Runs `fut` concurrently with this task as the current task.
    ///
    /// An error from `fut` fails the task (a cancellation error is ignored). The activity is
    /// aborted when the task is cleaned up.
    ///
    /// # Errors
    /// [`RuntimeError::InvalidState`] unless the task is running or waiting (or
    /// `opts.error_handler` is set).
    pub fn background<F>(&self, fut: F, opts: BackgroundOpts) -> Result<JoinHandle<()>, TaskError>
    where
        F: Future<Output = Result<(), TaskError>> + 'static,
    {
        let state = self.state();
        if !opts.error_handler && !matches!(state, TaskState::Running | TaskState::Waiting) {
            return Err(self.invalid_state(state, "start background activity for").into());
        }
        let untracked = opts.error_handler && state.is_finished();
        let wait = opts.wait && !untracked;

        let id = {
            let mut core = self.0.core.borrow_mut();
            core.next_background += 1;
            core.next_background
        };
        let guard = BackgroundGuard { task: self.downgrade(), id, wait };
        let task = self.clone();
        let activity = async move {
            let _guard = guard;
            if let Err(err) = fut.await {
                if !err.is_cancellation() {
                    task.fail(err);
                }
            }
        };
        let handle = tokio::task::spawn_local(current::scoped(self.clone(), activity));
        if !untracked {
            let mut core = self.0.core.borrow_mut();
            let set = if wait { &mut core.wait_background } else { &mut core.background };
            set.insert(id, handle.abort_handle());
        }
        Ok(handle)
    }

    /// Keeps the task from finishing while the returned guard lives.
    pub fn block_finishing(&self) -> FinishBlock {
        self.0.core.borrow_mut().block_finish += 1;
        FinishBlock { task: self.clone() }
    }

    /// Runs `f` with this task as the current task.
    pub fn as_current_task<R>(&self, f: impl FnOnce() -> R) -> R {
        with_current(self, f)
    }

    // ---- Events ----

    /// Stream of future events of `kind` (and its subtypes) emitted by this task or its
    /// descendants.
    pub fn events(&self, kind: EventType) -> EventStream {
        let mut core = self.0.core.borrow_mut();
        if core.cleaned_up {
            let cell = Cell::new();
            cell.close();
            return EventStream::new(cell);
        }
        EventStream::new(core.cursors.entry(kind).or_insert_with(Cell::new).clone())
    }

    /// Calls `handler` synchronously for every event of `kind` emitted by this task or its
    /// descendants, before `emit` returns.
    ///
    /// The handler runs with this task as the current task; an error fails this task.
    pub fn sync_handle_events(
        &self,
        kind: EventType,
        handler: impl Fn(&Event) -> Result<(), TaskError> + 'static,
    ) -> SyncHandlerRegistration {
        let owner = self.downgrade();
        let wrapper: SyncHandler = Rc::new(move |event: &Event| {
            let Some(task) = owner.upgrade() else {
                return;
            };
            let _frame = SyncFrame::enter();
            if let Err(err) = with_current(&task, || handler(event)) {
                task.fail(err);
            }
        });
        let mut core = self.0.core.borrow_mut();
        core.next_handler += 1;
        let id = core.next_handler;
        core.sync_handlers.entry(kind).or_default().push((id, wrapper));
        SyncHandlerRegistration { task: self.downgrade(), kind, id }
    }

    pub(crate) fn emit_event(&self, event: &Event) {
        let mut level = Some(self.clone());
        while let Some(task) = level {
            for kind in event.kind.lineage() {
                let handlers: Vec<SyncHandler> = task
                    .0
                    .core
                    .borrow()
                    .sync_handlers
                    .get(&kind)
                    .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
                    .unwrap_or_default();
                for handler in handlers {
                    handler(event);
                }
                let mut core = task.0.core.borrow_mut();
                if let Some(tail) = core.cursors.get_mut(&kind) {
                    *tail = tail.push(event.clone());
                }
            }
            level = task.parent();
        }
    }

    fn emit_as_self(&self, make: impl FnOnce() -> Event) {
        let event = with_current(self, make);
        self.emit_event(&event);
    }

    // ---- Context slots ----

    pub(crate) fn context_slot(&self, key: VarKey) -> Option<Slot> {
        self.0.core.borrow().context.get(&key).cloned()
    }

    pub(crate) fn set_context_slot(&self, key: VarKey, slot: Slot) {
        self.0.core.borrow_mut().context.insert(key, slot);
    }

    pub(crate) fn remove_context_slot(&self, key: VarKey) -> bool {
        self.0.core.borrow_mut().context.remove(&key).is_some()
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Task");
        out.field("id", &self.0.id);
        if let Ok(core) = self.0.core.try_borrow() {
            out.field("name", &core.name).field("state", &core.state);
        }
        out.finish()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

struct BackgroundGuard {
    task: WeakTask,
    id: u64,
    wait: bool,
}

impl Drop for BackgroundGuard {
    fn drop(&mut self) {
        let Some(task) = self.task.upgrade() else {
            return;
        };
        {
            let mut core = task.0.core.borrow_mut();
            core.background.remove(&self.id);
            core.wait_background.remove(&self.id);
        }
        if self.wait {
            task.check_finish();
        }
    }
}

/// Guard returned by [`Task::block_finishing`].
#[must_use = "the task may finish as soon as the guard is dropped"]
pub struct FinishBlock {
    task: Task,
}

impl Drop for FinishBlock {
    fn drop(&mut self) {
        {
            let mut core = self.task.0.core.borrow_mut();
            core.block_finish = core.block_finish.saturating_sub(1);
        }
        self.task.check_finish();
    }
}

/// Registration returned by [`Task::sync_handle_events`].
#[derive(Clone)]
pub struct SyncHandlerRegistration {
    task: WeakTask,
    kind: EventType,
    id: u64,
}

impl SyncHandlerRegistration {
    /// Unregisters the handler.
    pub fn remove(self) {
        if let Some(task) = self.task.upgrade() {
            if let Some(handlers) = task.0.core.borrow_mut().sync_handlers.get_mut(&self.kind) {
                handlers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}
