//! # Event streams over persistent lists.
//!
//! Each (task, event type) pair owns at most one unresolved *tail* cell. Emitting resolves the
//! tail with the event and a fresh tail; subscribing hands out a reader positioned at the
//! current tail. All readers at one bus level share the same cells, so an event is stored once
//! no matter how many streams observe it.
//!
//! ```text
//!  reader A ─┐                 reader B ─┐
//!            ▼                           ▼
//!        [ev 1] ──► [ev 2] ──► [ev 3] ──► [pending] ◄── tail (task, type)
//! ```
//!
//! ## Rules
//! - A stream yields exactly the events emitted after it was created, in emission order.
//! - Reading past the last event suspends until the next emission.
//! - When the subscribed task is cleaned up its tails are closed and streams end (`None`).
//! - Dropping a reader just stops reading; cells it no longer references are freed.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;

use crate::core::{BackgroundOpts, current_task};
use crate::error::TaskError;
use crate::events::Event;

enum CellState {
    Pending(Vec<Waker>),
    Ready(Event, Rc<Cell>),
    Closed,
}

pub(crate) struct Cell {
    state: RefCell<CellState>,
}

impl Cell {
    pub(crate) fn new() -> Rc<Cell> {
        Rc::new(Cell { state: RefCell::new(CellState::Pending(Vec::new())) })
    }

    /// Resolves this tail with `event` and returns the new tail.
    pub(crate) fn push(&self, event: Event) -> Rc<Cell> {
        let next = Cell::new();
        let previous = self.state.replace(CellState::Ready(event, next.clone()));
        if let CellState::Pending(wakers) = previous {
            wakers.into_iter().for_each(Waker::wake);
        }
        next
    }

    /// Ends every stream waiting on this tail.
    pub(crate) fn close(&self) {
        let previous = self.state.replace(CellState::Closed);
        if let CellState::Pending(wakers) = previous {
            wakers.into_iter().for_each(Waker::wake);
        }
    }
}

impl Drop for Cell {
    fn drop(&mut self) {
        // Unlink iteratively; a long unread chain would otherwise recurse once per event.
        let mut next = take_next(self.state.get_mut());
        while let Some(cell) = next {
            match Rc::try_unwrap(cell) {
                Ok(mut cell) => next = take_next(cell.state.get_mut()),
                Err(_) => break,
            }
        }
    }
}

fn take_next(state: &mut CellState) -> Option<Rc<Cell>> {
    match std::mem::replace(state, CellState::Closed) {
        CellState::Ready(_, next) => Some(next),
        _ => None,
    }
}

type Filter = Rc<dyn Fn(&Event) -> bool>;

/// Single-consumer, order-preserving stream of events from one task bus level.
///
/// Created by [`Task::events`](crate::Task::events).
pub struct EventStream {
    cell: Rc<Cell>,
    filter: Option<Filter>,
}

impl EventStream {
    pub(crate) fn new(cell: Rc<Cell>) -> Self {
        Self { cell, filter: None }
    }

    /// Only yield events for which `predicate` returns `true`.
    pub fn filter_events(mut self, predicate: impl Fn(&Event) -> bool + 'static) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(previous) => Rc::new(move |ev: &Event| previous(ev) && predicate(ev)),
            None => Rc::new(predicate),
        });
        self
    }

    /// Drains the stream with `f` in a background activity of the current task.
    ///
    /// With `wait`, the current task does not finish before `f` returns.
    pub fn process<F, Fut>(self, f: F, wait: bool) -> Result<JoinHandle<()>, TaskError>
    where
        F: FnOnce(EventStream) -> Fut,
        Fut: Future<Output = Result<(), TaskError>> + 'static,
    {
        let opts = BackgroundOpts { wait, ..BackgroundOpts::default() };
        current_task()?.background(f(self), opts)
    }

    /// Calls `handler` for every event in a background activity of the current task.
    ///
    /// The activity ends with the stream; an error from `handler` fails the current task. The
    /// task does not finish while a handler call is in progress.
    pub fn handle<F, Fut>(self, mut handler: F) -> Result<JoinHandle<()>, TaskError>
    where
        F: FnMut(Event) -> Fut + 'static,
        Fut: Future<Output = Result<(), TaskError>> + 'static,
    {
        let task = current_task()?;
        self.process(
            move |mut events| async move {
                while let Some(event) = events.next().await {
                    let _block = task.block_finishing();
                    handler(event).await?;
                }
                Ok(())
            },
            false,
        )
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        loop {
            let advanced = {
                let mut state = self.cell.state.borrow_mut();
                match &mut *state {
                    CellState::Ready(event, next) => Some((event.clone(), next.clone())),
                    CellState::Closed => return Poll::Ready(None),
                    CellState::Pending(wakers) => {
                        if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                            wakers.push(cx.waker().clone());
                        }
                        None
                    }
                }
            };
            let Some((event, next)) = advanced else {
                return Poll::Pending;
            };
            self.cell = next;
            if self.filter.as_ref().is_none_or(|keep| keep(&event)) {
                return Poll::Ready(Some(event));
            }
        }
    }
}
