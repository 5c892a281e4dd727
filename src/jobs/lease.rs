//! # Leases: one reserved concurrency slot each.
//!
//! A [`Lease`] is handed out immediately by [`Scheduler::request_lease`] and becomes *ready*
//! once its scheduler has a slot for it. Returning it (explicitly, or by dropping it) gives the
//! slot back exactly once.
//!
//! ## Rules
//! - A lease is owned by exactly one requester (`Lease` is not `Clone`).
//! - Dropping a ready lease returns its slot; dropping a pending lease abandons the request.
//!   Schedulers keep only weak references to pending leases, so an abandoned request is skipped
//!   when its turn comes instead of holding a slot.
//! - Ready callbacks run as deferred callbacks.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use crate::core::deferred;

/// Something that hands out leases.
pub trait Scheduler {
    /// Requests a slot; the returned lease may already be ready.
    fn request_lease(&self) -> Lease;
}

/// Where a ready lease gives its slot back.
pub(crate) trait SlotPool {
    fn release_slot(&self);
}

pub(crate) struct LeaseState {
    pool: Rc<dyn SlotPool>,
    ready: Cell<bool>,
    done: Cell<bool>,
    wakers: RefCell<Vec<Waker>>,
    callbacks: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl LeaseState {
    /// `true` while the requester still waits for this lease.
    pub(crate) fn is_live(&self) -> bool {
        !self.done.get() && !self.ready.get()
    }

    pub(crate) fn mark_ready(&self) {
        if self.ready.replace(true) {
            return;
        }
        for waker in self.wakers.take() {
            waker.wake();
        }
        for callback in self.callbacks.take() {
            deferred::defer(callback);
        }
    }

    fn return_slot(&self) {
        if self.done.replace(true) {
            return;
        }
        if self.ready.get() {
            self.pool.release_slot();
        }
    }
}

/// A reserved (or requested) concurrency slot.
pub struct Lease {
    state: Rc<LeaseState>,
}

impl Lease {
    pub(crate) fn new(pool: Rc<dyn SlotPool>) -> Self {
        Self {
            state: Rc::new(LeaseState {
                pool,
                ready: Cell::new(false),
                done: Cell::new(false),
                wakers: RefCell::new(Vec::new()),
                callbacks: RefCell::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<LeaseState> {
        Rc::downgrade(&self.state)
    }

    pub(crate) fn mark_ready(&self) {
        self.state.mark_ready();
    }

    /// `true` once the slot is reserved for this lease.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state.ready.get()
    }

    /// `true` once the lease was returned.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.state.done.get()
    }

    /// Runs `callback` (deferred) once the lease is ready.
    pub fn add_ready_callback(&self, callback: impl FnOnce() + 'static) {
        if self.is_ready() {
            deferred::defer(callback);
        } else {
            self.state.callbacks.borrow_mut().push(Box::new(callback));
        }
    }

    /// Waits until the lease is ready.
    pub fn ready(&self) -> Ready<'_> {
        Ready { lease: self }
    }

    /// Gives the slot back; later calls (and the drop) are no-ops.
    ///
    /// Returning a lease that never became ready abandons the request.
    pub fn return_lease(&self) {
        self.state.return_slot();
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.state.return_slot();
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("ready", &self.is_ready())
            .field("done", &self.is_done())
            .finish()
    }
}

/// Future returned by [`Lease::ready`].
pub struct Ready<'a> {
    lease: &'a Lease,
}

impl Future for Ready<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.lease.is_ready() {
            return Poll::Ready(());
        }
        let mut wakers = self.lease.state.wakers.borrow_mut();
        if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
            wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
