use std::borrow::Cow;

use async_trait::async_trait;

use crate::core::Task;
use crate::tasks::TaskHandler;

/// Handler of a task that only groups children.
///
/// The task is never discarded and restarts when a child is added after it finished.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskGroup;

#[async_trait(?Send)]
impl TaskHandler for TaskGroup {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("TaskGroup")
    }

    fn configure(&self, task: &Task) {
        task.configure_flags(Some(false), Some(true));
    }
}
