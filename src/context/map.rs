//! # Map-valued context variables.
//!
//! A [`ContextMap`] merges entries across the task chain instead of shadowing the whole value:
//! each task stores only the keys it changed, and a read walks from the task upwards until one
//! layer mentions the key.
//!
//! ```text
//! root layer     { CC: gcc, HOME: /home/u }
//!   group layer  { CC: clang }
//!     step layer { HOME: <deleted> }      view from step → { CC: clang }
//! ```
//!
//! ## Rules
//! - `insert` and `remove` only touch the layer of the task they act on.
//! - `remove` in a task writes a tombstone that hides the key inherited from ancestors.
//! - `inherit` drops the task's own entry (value or tombstone) so the ancestor value shows again.
//! - Outside of any task the default layer is modified directly.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::context::var::{Slot, VarKey, default_override, set_default_override};
use crate::core::{Task, current_task_or_none};
use crate::error::RuntimeError;

type Layer<K, V> = RefCell<HashMap<K, Option<V>>>;

/// Context variable holding a map merged across the task chain.
pub struct ContextMap<K, V> {
    key: VarKey,
    default: Option<fn() -> HashMap<K, V>>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> ContextMap<K, V>
where
    K: Eq + Hash + Clone + Debug + 'static,
    V: Clone + 'static,
{
    /// Declares a map that starts out empty.
    pub const fn new(group: &'static str, name: &'static str) -> Self {
        Self { key: VarKey { group, name }, default: None, _marker: PhantomData }
    }

    /// Declares a map whose default layer is built by `default` on first use.
    pub const fn with_default(
        group: &'static str,
        name: &'static str,
        default: fn() -> HashMap<K, V>,
    ) -> Self {
        Self { key: VarKey { group, name }, default: Some(default), _marker: PhantomData }
    }

    /// View from the current task (or the default layer outside of any task).
    pub fn view(&self) -> ContextMapView<'_, K, V> {
        ContextMapView { map: self, task: current_task_or_none() }
    }

    /// View from `task`.
    pub fn view_from(&self, task: &Task) -> ContextMapView<'_, K, V> {
        ContextMapView { map: self, task: Some(task.clone()) }
    }

    /// See [`ContextMapView::get`].
    pub fn get(&self, key: &K) -> Option<V> {
        self.view().get(key)
    }

    /// See [`ContextMapView::insert`].
    pub fn insert(&self, key: K, value: V) {
        self.view().insert(key, value)
    }

    /// See [`ContextMapView::remove`].
    pub fn remove(&self, key: &K) -> Result<(), RuntimeError> {
        self.view().remove(key)
    }

    /// See [`ContextMapView::inherit`].
    pub fn inherit(&self, key: &K) {
        self.view().inherit(key)
    }

    /// See [`ContextMapView::to_map`].
    pub fn to_map(&self) -> HashMap<K, V> {
        self.view().to_map()
    }

    fn default_layer(&self) -> Rc<Layer<K, V>> {
        if let Some(Some(slot)) = default_override(self.key) {
            if let Ok(layer) = slot.downcast::<Layer<K, V>>() {
                return layer;
            }
        }
        let initial = self.default.map(|make| make()).unwrap_or_default();
        let layer: Rc<Layer<K, V>> =
            Rc::new(RefCell::new(initial.into_iter().map(|(k, v)| (k, Some(v))).collect()));
        set_default_override(self.key, Some(layer.clone() as Slot));
        layer
    }

    fn task_layer(&self, task: &Task) -> Option<Rc<Layer<K, V>>> {
        task.context_slot(self.key).and_then(|slot| slot.downcast::<Layer<K, V>>().ok())
    }
}

impl<K, V> Debug for ContextMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextMap").field("key", &self.key).finish()
    }
}

/// A [`ContextMap`] as seen from one task.
pub struct ContextMapView<'a, K, V> {
    map: &'a ContextMap<K, V>,
    task: Option<Task>,
}

impl<K, V> ContextMapView<'_, K, V>
where
    K: Eq + Hash + Clone + Debug + 'static,
    V: Clone + 'static,
{
    /// Layers from nearest to farthest, ending with the default layer.
    fn layers(&self) -> Vec<Rc<Layer<K, V>>> {
        let mut layers = Vec::new();
        let mut cursor = self.task.clone();
        while let Some(task) = cursor {
            layers.extend(self.map.task_layer(&task));
            cursor = task.parent();
        }
        layers.push(self.map.default_layer());
        layers
    }

    fn own_layer(&self) -> Rc<Layer<K, V>> {
        let Some(task) = &self.task else {
            return self.map.default_layer();
        };
        if let Some(layer) = self.map.task_layer(task) {
            return layer;
        }
        let layer: Rc<Layer<K, V>> = Rc::new(RefCell::new(HashMap::new()));
        task.set_context_slot(self.map.key, layer.clone() as Slot);
        layer
    }

    /// Value visible for `key`, honouring tombstones.
    pub fn get(&self, key: &K) -> Option<V> {
        for layer in self.layers() {
            if let Some(entry) = layer.borrow().get(key) {
                return entry.clone();
            }
        }
        None
    }

    /// `true` if `key` is visible.
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Sets `key` at this level.
    pub fn insert(&self, key: K, value: V) {
        self.own_layer().borrow_mut().insert(key, Some(value));
    }

    /// Hides `key` from this level downwards.
    ///
    /// # Errors
    /// [`RuntimeError::KeyNotFound`] if `key` is not visible.
    pub fn remove(&self, key: &K) -> Result<(), RuntimeError> {
        if !self.contains_key(key) {
            return Err(RuntimeError::KeyNotFound {
                name: self.map.key.to_string(),
                key: format!("{key:?}"),
            });
        }
        let layer = self.own_layer();
        let mut layer = layer.borrow_mut();
        if self.task.is_some() {
            layer.insert(key.clone(), None);
        } else {
            layer.remove(key);
        }
        Ok(())
    }

    /// Forgets this level's entry for `key`, exposing the inherited value again.
    pub fn inherit(&self, key: &K) {
        if let Some(task) = &self.task {
            if let Some(layer) = self.map.task_layer(task) {
                layer.borrow_mut().remove(key);
            }
        }
    }

    /// The merged map visible at this level.
    pub fn to_map(&self) -> HashMap<K, V> {
        let mut seen = HashSet::new();
        let mut merged = HashMap::new();
        for layer in self.layers() {
            for (key, entry) in layer.borrow().iter() {
                if !seen.insert(key.clone()) {
                    continue;
                }
                if let Some(value) = entry {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        merged
    }

    /// Number of visible keys.
    pub fn len(&self) -> usize {
        self.to_map().len()
    }

    /// `true` when no key is visible.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLAGS: ContextMap<String, i32> =
        ContextMap::with_default("TestContext", "flags", || HashMap::from([("a".to_string(), 1)]));

    #[test]
    fn test_default_layer_outside_tasks() {
        // Each test runs on its own thread, so default layers do not leak between tests.
        assert_eq!(FLAGS.get(&"a".to_string()), Some(1));
        FLAGS.insert("b".to_string(), 2);
        assert_eq!(FLAGS.to_map().len(), 2);

        FLAGS.remove(&"a".to_string()).unwrap();
        assert_eq!(FLAGS.get(&"a".to_string()), None);
        assert!(FLAGS.remove(&"a".to_string()).is_err());
        assert_eq!(FLAGS.view().len(), 1);
    }
}
