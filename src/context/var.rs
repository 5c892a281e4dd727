//! # Task-scoped context variables.
//!
//! A [`ContextVar`] is a named slot (`group.field`) whose value is looked up from the current
//! task upwards through its ancestors, falling back to a default.
//!
//! ## Rules
//! - `get` walks current task → parent → … → root → default; binding is late (the nearest
//!   override at read time wins, not a snapshot taken when a child was created).
//! - `set` writes an override for the current task only; outside of any task it replaces the
//!   default.
//! - `delete` removes the override of exactly the current task (or the default outside of any
//!   task) and fails if there is none.
//! - `*_in(task)` variants act as if `task` were current.
//!
//! Defaults replaced at runtime are stored per thread, i.e. per task loop.
//!
//! ## Example
//! ```rust
//! use taskloop::ContextVar;
//!
//! struct BuildContext;
//!
//! impl BuildContext {
//!     pub const JOBS: ContextVar<u32> = ContextVar::with_default("BuildContext", "jobs", || 1);
//!     pub const TARGET: ContextVar<String> = ContextVar::new("BuildContext", "target");
//! }
//!
//! assert_eq!(BuildContext::JOBS.get().unwrap(), 1);
//! assert!(BuildContext::TARGET.get().is_err());
//! ```

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::core::{Task, current_task_or_none};
use crate::error::RuntimeError;

/// Identity of a context slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarKey {
    /// Name of the variable group.
    pub group: &'static str,
    /// Name of the field within the group.
    pub name: &'static str,
}

impl fmt::Display for VarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

pub(crate) type Slot = Rc<dyn Any>;

enum DefaultOverride {
    Value(Slot),
    Deleted,
}

thread_local! {
    static DEFAULTS: RefCell<HashMap<VarKey, DefaultOverride>> = RefCell::new(HashMap::new());
}

/// Looks `key` up from `task` upwards.
pub(crate) fn lookup(task: Option<&Task>, key: VarKey) -> Option<Slot> {
    let mut cursor = task.cloned();
    while let Some(task) = cursor {
        if let Some(slot) = task.context_slot(key) {
            return Some(slot);
        }
        cursor = task.parent();
    }
    None
}

/// Replaced default: `Some(Some(v))` overridden, `Some(None)` deleted, `None` untouched.
pub(crate) fn default_override(key: VarKey) -> Option<Option<Slot>> {
    DEFAULTS.with(|d| {
        d.borrow().get(&key).map(|o| match o {
            DefaultOverride::Value(slot) => Some(slot.clone()),
            DefaultOverride::Deleted => None,
        })
    })
}

pub(crate) fn set_default_override(key: VarKey, slot: Option<Slot>) {
    let value = match slot {
        Some(slot) => DefaultOverride::Value(slot),
        None => DefaultOverride::Deleted,
    };
    DEFAULTS.with(|d| d.borrow_mut().insert(key, value));
}

/// Drops every default replaced on this thread.
pub(crate) fn reset_defaults() {
    let defaults = DEFAULTS.with(|d| std::mem::take(&mut *d.borrow_mut()));
    drop(defaults);
}

/// Inheritable, lazily defaulted value attached to the task tree.
pub struct ContextVar<T> {
    key: VarKey,
    default: Option<fn() -> T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + 'static> ContextVar<T> {
    /// Declares a variable without a default.
    pub const fn new(group: &'static str, name: &'static str) -> Self {
        Self { key: VarKey { group, name }, default: None, _marker: PhantomData }
    }

    /// Declares a variable whose default is produced by `default` on each read.
    pub const fn with_default(group: &'static str, name: &'static str, default: fn() -> T) -> Self {
        Self { key: VarKey { group, name }, default: Some(default), _marker: PhantomData }
    }

    /// The slot identity.
    #[inline]
    pub fn key(&self) -> VarKey {
        self.key
    }

    /// Reads the value visible from the current task.
    ///
    /// # Errors
    /// [`RuntimeError::NotSet`] when no task in the chain has an override and there is no
    /// default.
    pub fn get(&self) -> Result<T, RuntimeError> {
        self.read(current_task_or_none().as_ref())
    }

    /// Reads the value visible from `task`.
    pub fn get_in(&self, task: &Task) -> Result<T, RuntimeError> {
        self.read(Some(task))
    }

    /// Sets the value for the current task, or the default outside of any task.
    pub fn set(&self, value: T) {
        match current_task_or_none() {
            Some(task) => task.set_context_slot(self.key, Rc::new(value)),
            None => set_default_override(self.key, Some(Rc::new(value))),
        }
    }

    /// Sets the value for `task`.
    pub fn set_in(&self, task: &Task, value: T) {
        task.set_context_slot(self.key, Rc::new(value));
    }

    /// Removes the current task's override (or the default outside of any task).
    ///
    /// # Errors
    /// [`RuntimeError::NotSet`] when there is nothing to remove at that level.
    pub fn delete(&self) -> Result<(), RuntimeError> {
        match current_task_or_none() {
            Some(task) => self.delete_in(&task),
            None => {
                let has_default = match default_override(self.key) {
                    Some(slot) => slot.is_some(),
                    None => self.default.is_some(),
                };
                if !has_default {
                    return Err(self.not_set());
                }
                set_default_override(self.key, None);
                Ok(())
            }
        }
    }

    /// Removes `task`'s own override.
    pub fn delete_in(&self, task: &Task) -> Result<(), RuntimeError> {
        if task.remove_context_slot(self.key) { Ok(()) } else { Err(self.not_set()) }
    }

    fn read(&self, task: Option<&Task>) -> Result<T, RuntimeError> {
        let slot = lookup(task, self.key).or_else(|| match default_override(self.key) {
            Some(slot) => slot,
            None => self.default.map(|make| Rc::new(make()) as Slot),
        });
        slot.and_then(|slot| slot.downcast_ref::<T>().cloned()).ok_or_else(|| self.not_set())
    }

    fn not_set(&self) -> RuntimeError {
        RuntimeError::NotSet { name: self.key.to_string() }
    }
}

impl<T> fmt::Debug for ContextVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextVar").field("key", &self.key).finish()
    }
}
