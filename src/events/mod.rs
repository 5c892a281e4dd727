//! Task events: data model and per-task streams.
//!
//! ## Contents
//! - [`EventType`], [`Event`] event classification and payload
//! - [`EventStream`] lazy reader over a task's bus, built on persistent lists
//!
//! Emission and synchronous handlers live on [`Task`](crate::Task): see
//! [`Event::emit`], [`Task::events`](crate::Task::events) and
//! [`Task::sync_handle_events`](crate::Task::sync_handle_events).

mod event;
mod stream;

pub use event::{Event, EventType};
pub use stream::EventStream;

pub(crate) use stream::Cell;
