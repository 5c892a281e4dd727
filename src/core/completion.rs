//! # One-shot completion cell.
//!
//! Backs a task's `started` and `finished` futures. A completion resolves exactly once to an
//! [`Outcome`]; awaiting it is a suspension point, and callbacks registered on it run as
//! deferred callbacks in registration order.
//!
//! ## Rules
//! - `resolve` is idempotent: only the first call has an effect.
//! - Callbacks registered after resolution are still deferred, never run inline.
//! - Callback ids are unique per thread, so removing an id registered on another cell (e.g. the
//!   cell of an earlier task lifetime) is a no-op.
//! - Removing a callback that already fired is a no-op; stale callbacks from an earlier task
//!   lifetime are filtered by the restart counter at the call site.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::core::deferred;
use crate::error::TaskError;

/// How a task (or its start) resolved.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Done,
    Failed(TaskError),
    Cancelled,
}

type Callback = Box<dyn FnOnce(Outcome)>;

thread_local! {
    static NEXT_CALLBACK_ID: Cell<u64> = const { Cell::new(0) };
}

#[derive(Default)]
struct Slot {
    outcome: Option<Outcome>,
    wakers: Vec<Waker>,
    callbacks: Vec<(u64, Callback)>,
}

/// Shared one-shot cell; clones observe the same resolution.
#[derive(Clone, Default)]
pub(crate) struct Completion(Rc<RefCell<Slot>>);

impl Completion {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.0.borrow().outcome.is_some()
    }

    /// Resolves the cell; returns `false` if it was already resolved.
    pub(crate) fn resolve(&self, outcome: Outcome) -> bool {
        let (wakers, callbacks) = {
            let mut slot = self.0.borrow_mut();
            if slot.outcome.is_some() {
                return false;
            }
            slot.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut slot.wakers),
                std::mem::take(&mut slot.callbacks),
            )
        };
        for waker in wakers {
            waker.wake();
        }
        for (_, callback) in callbacks {
            let outcome = outcome.clone();
            deferred::defer(move || callback(outcome));
        }
        true
    }

    /// Registers `callback` to run (deferred) once the cell resolves.
    pub(crate) fn on_resolved(&self, callback: impl FnOnce(Outcome) + 'static) -> u64 {
        let mut slot = self.0.borrow_mut();
        let id = NEXT_CALLBACK_ID.with(|next| next.replace(next.get() + 1));
        match slot.outcome.clone() {
            Some(outcome) => {
                drop(slot);
                deferred::defer(move || callback(outcome));
            }
            None => slot.callbacks.push((id, Box::new(callback))),
        }
        id
    }

    pub(crate) fn remove_callback(&self, id: u64) {
        self.0.borrow_mut().callbacks.retain(|(cb_id, _)| *cb_id != id);
    }

    /// Future resolving to the outcome.
    pub(crate) fn wait(&self) -> Wait {
        Wait { cell: self.clone() }
    }
}

pub(crate) struct Wait {
    cell: Completion,
}

impl Future for Wait {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome> {
        let mut slot = self.cell.0.borrow_mut();
        match &slot.outcome {
            Some(outcome) => Poll::Ready(outcome.clone()),
            None => {
                if !slot.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    slot.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callbacks_run_deferred_in_order() {
        let cell = Completion::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            cell.on_resolved(move |_| order.borrow_mut().push(i));
        }
        assert!(cell.resolve(Outcome::Done));
        assert!(!cell.resolve(Outcome::Cancelled));
        assert!(order.borrow().is_empty());

        deferred::run_pending();
        assert_eq!(*order.borrow(), [0, 1, 2]);
    }

    #[test]
    fn test_removing_id_of_other_cell_keeps_callback() {
        let previous = Completion::new();
        let current = Completion::new();
        let stale = previous.on_resolved(|_| {});
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        current.on_resolved(move |_| flag.set(true));

        current.remove_callback(stale);
        current.resolve(Outcome::Done);
        deferred::run_pending();
        assert!(fired.get());
    }
}
