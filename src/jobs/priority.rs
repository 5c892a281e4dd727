//! # Priority-ordered leases.
//!
//! [`PriorityScheduler`] sits in front of another [`Scheduler`]. Every request captures the
//! ambient [`JobPriorities::PRIORITY`] and asks the parent for one lease. Whenever a parent
//! lease becomes ready it goes to the best request still waiting, not to the one that caused it.
//!
//! Priorities are compared lexicographically after padding the shorter tuple with zeros; the
//! larger wins, equal priorities are served in request order. A request whose lease was dropped
//! before being served is skipped and the parent lease is returned unused.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::rc::{Rc, Weak};

use crate::context::ContextVar;
use crate::core::deferred;
use crate::jobs::lease::{Lease, LeaseState, Scheduler, SlotPool};

/// Context variables selecting the scheduler and priority used for task leases.
pub struct JobPriorities;

impl JobPriorities {
    /// Scheduler tasks request their leases from. The task loop installs a default.
    pub const SCHEDULER: ContextVar<Rc<dyn Scheduler>> = ContextVar::new("JobPriorities", "scheduler");

    /// Priority used by [`PriorityScheduler`]; lexicographically largest first.
    pub const PRIORITY: ContextVar<Vec<i64>> = ContextVar::with_default("JobPriorities", "priority", Vec::new);
}

struct Item {
    priority: Vec<i64>,
    seq: u64,
    lease: Weak<LeaseState>,
}

fn compare_padded(a: &[i64], b: &[i64]) -> Ordering {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0)))
        .find(|ord| ord.is_ne())
        .unwrap_or(Ordering::Equal)
}

impl Ord for Item {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_padded(&self.priority, &other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Item {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for Item {}

#[derive(Default)]
struct Queue {
    waiting: BinaryHeap<Item>,
    seq: u64,
    pending_parent: HashMap<u64, Lease>,
    held_parent: Vec<Lease>,
}

struct PriorityInner {
    parent: Rc<dyn Scheduler>,
    queue: RefCell<Queue>,
}

/// Scheduler granting leases by [`JobPriorities::PRIORITY`].
#[derive(Clone)]
pub struct PriorityScheduler {
    inner: Rc<PriorityInner>,
}

impl PriorityScheduler {
    pub fn new(parent: Rc<dyn Scheduler>) -> Self {
        Self {
            inner: Rc::new(PriorityInner { parent, queue: RefCell::new(Queue::default()) }),
        }
    }
}

impl Scheduler for PriorityScheduler {
    fn request_lease(&self) -> Lease {
        let lease = Lease::new(self.inner.clone());
        let priority = JobPriorities::PRIORITY.get().unwrap_or_default();

        let seq = {
            let mut queue = self.inner.queue.borrow_mut();
            queue.seq += 1;
            let seq = queue.seq;
            queue.waiting.push(Item { priority, seq, lease: lease.downgrade() });
            seq
        };

        let parent_lease = self.inner.parent.request_lease();
        let ready = parent_lease.is_ready();
        let weak = Rc::downgrade(&self.inner);
        let acquired = move || {
            if let Some(inner) = weak.upgrade() {
                inner.acquired(seq);
            }
        };
        if ready {
            deferred::defer(acquired);
        } else {
            parent_lease.add_ready_callback(acquired);
        }
        self.inner.queue.borrow_mut().pending_parent.insert(seq, parent_lease);
        lease
    }
}

impl PriorityInner {
    fn next_waiting(&self) -> Option<Rc<LeaseState>> {
        let mut queue = self.queue.borrow_mut();
        while let Some(item) = queue.waiting.pop() {
            if let Some(lease) = item.lease.upgrade().filter(|l| l.is_live()) {
                return Some(lease);
            }
        }
        None
    }

    fn acquired(&self, id: u64) {
        let Some(parent_lease) = self.queue.borrow_mut().pending_parent.remove(&id) else {
            return;
        };
        match self.next_waiting() {
            Some(lease) => {
                self.queue.borrow_mut().held_parent.push(parent_lease);
                lease.mark_ready();
            }
            None => drop(parent_lease),
        }
    }
}

impl SlotPool for PriorityInner {
    fn release_slot(&self) {
        let held = self.queue.borrow_mut().held_parent.pop();
        drop(held);
    }
}
