//! Per-module configuration and runtime data storage.
//!
//! Each registered module owns one slot, addressed by its module index,
//! in three places: the per-context configuration slots, the
//! per-connection data array, and the per-transaction data array. The
//! slot type is opaque to the engine; modules downcast their own slots
//! back to their concrete types.

use std::any::Any;

use serde::{Deserialize, Serialize};

/// Marker for types a module may store as its per-context configuration.
///
/// Blanket-implemented for every `'static + Clone + Send + Sync` type, so
/// modules use plain derived structs without ceremony. The `Clone` bound
/// is what lets a child context start from a copy of its parent's slot.
pub trait ConfigData: Any + Send + Sync {
    /// Upcasts to [`Any`] for downcasting by the owning module.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast to [`Any`].
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Clones the configuration behind the trait object.
    fn clone_box(&self) -> Box<dyn ConfigData>;
}

impl<T: Any + Clone + Send + Sync> ConfigData for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_box(&self) -> Box<dyn ConfigData> {
        Box::new(self.clone())
    }
}

/// A value in a context's named configuration map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// String value.
    String(String),
    /// Integer value.
    Integer(i64),
    /// Floating point value.
    Float(f64),
    /// Boolean value.
    Bool(bool),
    /// Array of values.
    Array(Vec<ConfigValue>),
    /// Nested table.
    Table(std::collections::HashMap<String, ConfigValue>),
}

impl ConfigValue {
    /// The integer value, if this is an integer.
    #[must_use]
    pub fn as_num(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// The string value, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The boolean value, if this is a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<i64> for ConfigValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<bool> for ConfigValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// Index-addressed per-module data slots.
///
/// Used on connections and transactions so each module can stash its own
/// runtime state. Slots start empty and the array grows on demand; a
/// module that never stores anything costs nothing.
#[derive(Default)]
pub struct ModuleDataArray {
    slots: Vec<Option<Box<dyn Any + Send + Sync>>>,
}

impl ModuleDataArray {
    /// Creates an empty array.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` in the slot for module `index`, replacing any
    /// previous value.
    pub fn set<T: Any + Send + Sync>(&mut self, index: usize, data: T) {
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        self.slots[index] = Some(Box::new(data));
    }

    /// Borrows the slot for module `index`, downcast to `T`.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, index: usize) -> Option<&T> {
        self.slots.get(index)?.as_ref()?.downcast_ref::<T>()
    }

    /// Mutably borrows the slot for module `index`, downcast to `T`.
    #[must_use]
    pub fn get_mut<T: Any + Send + Sync>(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)?.as_mut()?.downcast_mut::<T>()
    }

    /// Clears the slot for module `index`.
    pub fn remove(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = None;
        }
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl std::fmt::Debug for ModuleDataArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDataArray")
            .field("slots", &self.slots.len())
            .field("occupied", &self.occupied())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct AclState {
        hits: u32,
    }

    #[test]
    fn test_set_get_roundtrip() {
        let mut data = ModuleDataArray::new();
        data.set(3, AclState { hits: 1 });
        assert_eq!(data.get::<AclState>(3), Some(&AclState { hits: 1 }));
        assert_eq!(data.get::<AclState>(0), None);
    }

    #[test]
    fn test_wrong_type_downcast() {
        let mut data = ModuleDataArray::new();
        data.set(0, AclState { hits: 0 });
        assert_eq!(data.get::<String>(0), None);
    }

    #[test]
    fn test_get_mut_and_remove() {
        let mut data = ModuleDataArray::new();
        data.set(1, AclState { hits: 0 });
        data.get_mut::<AclState>(1).unwrap().hits = 5;
        assert_eq!(data.get::<AclState>(1).unwrap().hits, 5);

        data.remove(1);
        assert_eq!(data.get::<AclState>(1), None);
        assert_eq!(data.occupied(), 0);
    }

    #[test]
    fn test_config_value_accessors() {
        assert_eq!(ConfigValue::from(7).as_num(), Some(7));
        assert_eq!(ConfigValue::from("on").as_str(), Some("on"));
        assert_eq!(ConfigValue::from("on").as_num(), None);
    }
}
