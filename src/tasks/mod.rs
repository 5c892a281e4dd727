//! # Task behaviour.
//!
//! - [`TaskHandler`]: lifecycle hooks implemented by task types
//! - [`TaskFn`]: closure-backed handler
//! - [`TaskGroup`]: handler of grouping tasks
//! - [`TaskBuilder`]: name and flags set before the task starts

mod builder;
mod group;
mod handler;
mod task_fn;

pub use builder::TaskBuilder;
pub use group::TaskGroup;
pub use handler::TaskHandler;
pub use task_fn::TaskFn;
