use std::borrow::Cow;
use std::future::Future;
use std::rc::Rc;

use crate::core::Task;
use crate::error::{RuntimeError, TaskError};
use crate::tasks::{TaskFn, TaskHandler};

/// Builder for tasks with a fluent API.
///
/// Unset options keep what the handler's `configure` hook chose.
#[derive(Clone, Default)]
pub struct TaskBuilder {
    pub(crate) name: Option<Cow<'static, str>>,
    pub(crate) use_lease: Option<bool>,
    pub(crate) discard: Option<bool>,
    pub(crate) restart_on_new_children: Option<bool>,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Acquire a job lease before running.
    pub fn with_lease(mut self, use_lease: bool) -> Self {
        self.use_lease = Some(use_lease);
        self
    }

    pub fn with_discard(mut self, discard: bool) -> Self {
        self.discard = Some(discard);
        self
    }

    pub fn with_restart_on_new_children(mut self, restart: bool) -> Self {
        self.restart_on_new_children = Some(restart);
        self
    }

    /// Creates the task as a child of the current task.
    ///
    /// # Errors
    /// No current task, no running task loop, or a parent that cannot take children.
    pub fn build<H: TaskHandler>(self, handler: H) -> Result<Task, RuntimeError> {
        Task::create(Rc::new(handler), self)
    }

    /// Like [`build`](Self::build), keeping a reference to the handler.
    pub fn build_shared<H: TaskHandler>(self, handler: Rc<H>) -> Result<Task, RuntimeError> {
        Task::create(handler, self)
    }

    /// Creates a task running `f`.
    pub fn build_fn<F, Fut>(self, f: F) -> Result<Task, RuntimeError>
    where
        F: Fn(Task) -> Fut + 'static,
        Fut: Future<Output = Result<(), TaskError>> + 'static,
    {
        self.build(TaskFn::new(f))
    }
}

impl Task {
    /// Creates a builder for a child of the current task.
    pub fn builder() -> TaskBuilder {
        TaskBuilder::new()
    }
}
