//! # Closure-backed handler (`TaskFn`)
//!
//! [`TaskFn`] wraps a closure `F: Fn(Task) -> Fut`, producing a fresh future per run. A task
//! group that restarts runs the closure again, so it is `Fn`, not `FnOnce`.
//!
//! ## Example
//! ```no_run
//! use taskloop::{Task, TaskError, TaskFn};
//!
//! # fn demo() -> Result<(), TaskError> {
//! let task = Task::new(TaskFn::new(|task: Task| async move {
//!     taskloop::log(format!("running {}", task.path()));
//!     Ok(())
//! }))?;
//! # Ok(()) }
//! ```

use std::borrow::Cow;
use std::future::Future;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::LocalBoxFuture;

use crate::core::Task;
use crate::error::TaskError;
use crate::tasks::TaskHandler;

type Hook = Box<dyn Fn(Task) -> LocalBoxFuture<'static, Result<(), TaskError>>>;

fn hook<F, Fut>(f: F) -> Hook
where
    F: Fn(Task) -> Fut + 'static,
    Fut: Future<Output = Result<(), TaskError>> + 'static,
{
    Box::new(move |task| f(task).boxed_local())
}

/// Handler built from closures.
pub struct TaskFn {
    name: Cow<'static, str>,
    run: Option<Hook>,
    prepare: Option<Hook>,
}

impl TaskFn {
    /// Handler running `f` as its `on_run` hook.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Task) -> Fut + 'static,
        Fut: Future<Output = Result<(), TaskError>> + 'static,
    {
        Self { name: Cow::Borrowed("Task"), run: Some(hook(f)), prepare: None }
    }

    /// Handler with only an `on_prepare` hook.
    pub fn prepare_only<F, Fut>(f: F) -> Self
    where
        F: Fn(Task) -> Fut + 'static,
        Fut: Future<Output = Result<(), TaskError>> + 'static,
    {
        Self { name: Cow::Borrowed("Task"), run: None, prepare: Some(hook(f)) }
    }

    /// Sets the default task name.
    pub fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds an `on_prepare` hook.
    pub fn with_prepare<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Task) -> Fut + 'static,
        Fut: Future<Output = Result<(), TaskError>> + 'static,
    {
        self.prepare = Some(hook(f));
        self
    }
}

#[async_trait(?Send)]
impl TaskHandler for TaskFn {
    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    async fn on_prepare(&self, task: &Task) -> Result<(), TaskError> {
        match &self.prepare {
            Some(prepare) => prepare(task.clone()).await,
            None => Ok(()),
        }
    }

    async fn on_run(&self, task: &Task) -> Result<(), TaskError> {
        match &self.run {
            Some(run) => run(task.clone()).await,
            None => Ok(()),
        }
    }
}
