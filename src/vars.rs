//! Per-transaction variable store.
//!
//! A flat name→value map used by rule operators and for mirroring
//! transaction flags into named variables. The value format is opaque to
//! the engine core; everything is stored as strings.

use std::collections::HashMap;

/// A case-insensitive string-keyed variable store.
#[derive(Debug, Clone, Default)]
pub struct VarStore {
    values: HashMap<String, String>,
}

impl VarStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a variable, replacing any previous value.
    pub fn set(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.values
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    /// Mirrors a boolean flag into the store as `"1"` or `"0"`.
    pub fn set_flag(&mut self, name: impl AsRef<str>, value: bool) {
        self.set(name, if value { "1" } else { "0" });
    }

    /// Gets a variable's value.
    #[must_use]
    pub fn get(&self, name: impl AsRef<str>) -> Option<&str> {
        self.values
            .get(&name.as_ref().to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Removes a variable, returning its previous value.
    pub fn remove(&mut self, name: impl AsRef<str>) -> Option<String> {
        self.values.remove(&name.as_ref().to_ascii_lowercase())
    }

    /// Returns the number of variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over all `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let mut vars = VarStore::new();
        vars.set("request_method", "GET");
        assert_eq!(vars.get("request_method"), Some("GET"));
        assert_eq!(vars.get("missing"), None);
    }

    #[test]
    fn test_case_insensitive_keys() {
        let mut vars = VarStore::new();
        vars.set("Request-Host", "example.com");
        assert_eq!(vars.get("request-host"), Some("example.com"));
    }

    #[test]
    fn test_set_flag() {
        let mut vars = VarStore::new();
        vars.set_flag("pipelined", true);
        assert_eq!(vars.get("pipelined"), Some("1"));
        vars.set_flag("pipelined", false);
        assert_eq!(vars.get("pipelined"), Some("0"));
    }

    #[test]
    fn test_remove() {
        let mut vars = VarStore::new();
        vars.set("a", "1");
        assert_eq!(vars.remove("A"), Some("1".to_string()));
        assert!(vars.is_empty());
    }
}
