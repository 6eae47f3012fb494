//! Module registry.
//!
//! Registered modules live in an index-ordered list. A module's index is
//! its position at registration time and is never reused: when a
//! module's `init` fails or the module is unregistered, its slot is
//! nulled and stays null, so every other module's configuration and data
//! slots keep their addresses.

use std::fmt;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::module::Module;

struct ModuleEntry {
    index: usize,
    module: Arc<dyn Module>,
}

/// Index-ordered collection of registered modules.
#[derive(Default)]
pub struct ModuleRegistry {
    entries: Vec<Option<ModuleEntry>>,
}

impl ModuleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The index the next registered module will receive.
    #[must_use]
    pub fn next_index(&self) -> usize {
        self.entries.len()
    }

    /// Appends a module at the next index.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] if a live module with
    /// the same name is already registered.
    pub fn push(&mut self, module: Arc<dyn Module>) -> EngineResult<usize> {
        if self.by_name(module.name()).is_some() {
            return Err(EngineError::InvalidArgument(format!(
                "module '{}' is already registered",
                module.name()
            )));
        }
        let index = self.entries.len();
        self.entries.push(Some(ModuleEntry { index, module }));
        Ok(index)
    }

    /// Nulls the slot at `index`, retiring it permanently.
    ///
    /// Returns the module that occupied the slot, if any.
    pub fn retire(&mut self, index: usize) -> Option<Arc<dyn Module>> {
        self.entries
            .get_mut(index)
            .and_then(Option::take)
            .map(|entry| entry.module)
    }

    /// The module at `index`, if the slot is live.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Arc<dyn Module>> {
        self.entries
            .get(index)?
            .as_ref()
            .map(|entry| &entry.module)
    }

    /// Looks a live module up by name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<(usize, &Arc<dyn Module>)> {
        self.iter().find(|(_, m)| m.name() == name)
    }

    /// Iterates over live `(index, module)` pairs in index order,
    /// skipping retired slots.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Arc<dyn Module>)> {
        self.entries
            .iter()
            .filter_map(|slot| slot.as_ref())
            .map(|entry| (entry.index, &entry.module))
    }

    /// Number of live modules.
    #[must_use]
    pub fn count(&self) -> usize {
        self.iter().count()
    }

    /// Total slots ever assigned, including retired ones. This bounds
    /// per-context and per-connection slot arrays.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("live", &self.count())
            .field("slots", &self.slot_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Module for Named {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_indices_assigned_in_order() {
        let mut registry = ModuleRegistry::new();
        assert_eq!(registry.push(Arc::new(Named("core"))).unwrap(), 0);
        assert_eq!(registry.push(Arc::new(Named("acl"))).unwrap(), 1);
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = ModuleRegistry::new();
        registry.push(Arc::new(Named("core"))).unwrap();
        assert!(matches!(
            registry.push(Arc::new(Named("core"))),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_retired_index_not_reused() {
        let mut registry = ModuleRegistry::new();
        registry.push(Arc::new(Named("core"))).unwrap();
        let idx = registry.push(Arc::new(Named("acl"))).unwrap();
        assert!(registry.retire(idx).is_some());

        assert!(registry.get(idx).is_none());
        assert_eq!(registry.push(Arc::new(Named("geo"))).unwrap(), 2);
        assert_eq!(registry.slot_count(), 3);
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_by_name_skips_retired() {
        let mut registry = ModuleRegistry::new();
        let idx = registry.push(Arc::new(Named("acl"))).unwrap();
        registry.retire(idx);
        assert!(registry.by_name("acl").is_none());
    }

    #[test]
    fn test_iter_in_index_order() {
        let mut registry = ModuleRegistry::new();
        registry.push(Arc::new(Named("a"))).unwrap();
        let idx = registry.push(Arc::new(Named("b"))).unwrap();
        registry.push(Arc::new(Named("c"))).unwrap();
        registry.retire(idx);

        let names: Vec<_> = registry.iter().map(|(_, m)| m.name().to_string()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }
}
