//! # Deferred callbacks ("call soon").
//!
//! Completion callbacks, lease readiness callbacks and a few cleanup steps must not run inside
//! the code that triggered them: they run on the next turn of the loop, in FIFO order.
//!
//! The queue is per thread. The task loop spawns [`drive`] on its `LocalSet`; everything queued
//! while the loop is running executes there. Outside a loop the queue only accumulates and is
//! discarded by [`clear`] during teardown.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::poll_fn;
use std::task::{Poll, Waker};

type Callback = Box<dyn FnOnce()>;

#[derive(Default)]
struct Queue {
    items: VecDeque<Callback>,
    driver: Option<Waker>,
}

thread_local! {
    static QUEUE: RefCell<Queue> = RefCell::new(Queue::default());
}

/// Schedules `f` to run on the next turn of the loop.
pub(crate) fn defer(f: impl FnOnce() + 'static) {
    let driver = QUEUE.with(|q| {
        let mut q = q.borrow_mut();
        q.items.push_back(Box::new(f));
        q.driver.take()
    });
    if let Some(waker) = driver {
        waker.wake();
    }
}

fn pop() -> Option<Callback> {
    QUEUE.with(|q| q.borrow_mut().items.pop_front())
}

/// Runs deferred callbacks forever; spawned once per task loop.
pub(crate) async fn drive() {
    poll_fn(|cx| {
        loop {
            // Callbacks may defer more work; keep draining until the queue is empty.
            while let Some(callback) = pop() {
                callback();
            }
            let parked = QUEUE.with(|q| {
                let mut q = q.borrow_mut();
                if q.items.is_empty() {
                    q.driver = Some(cx.waker().clone());
                    true
                } else {
                    false
                }
            });
            if parked {
                return Poll::<()>::Pending;
            }
        }
    })
    .await
}

/// Drops every queued callback without running it.
pub(crate) fn clear() {
    // Dropping a callback can queue new ones (e.g. a lease returned on drop).
    while let Some(callback) = pop() {
        drop(callback);
    }
    QUEUE.with(|q| q.borrow_mut().driver = None);
}

/// Runs queued callbacks without a loop (unit tests).
#[cfg(test)]
pub(crate) fn run_pending() {
    while let Some(callback) = pop() {
        callback();
    }
}
