//! Current and default values of stateful variables.

use std::collections::{BTreeMap, HashMap};

/// Mutable store of stateful variable values.
///
/// Defaults are captured when the table is loaded; [`InstrumentState::reset`]
/// restores them. Validation rules live in the
/// [`ValidationStore`](super::validation::ValidationStore).
#[derive(Debug, Clone, Default)]
pub struct InstrumentState {
    current: HashMap<String, String>,
    defaults: HashMap<String, String>,
}

impl InstrumentState {
    /// Creates state whose current values start at `defaults`.
    #[must_use]
    pub fn new(defaults: HashMap<String, String>) -> Self {
        Self {
            current: defaults.clone(),
            defaults,
        }
    }

    /// Current value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.current.get(key).map(String::as_str)
    }

    /// Load-time value of `key`.
    #[must_use]
    pub fn default_value(&self, key: &str) -> Option<&str> {
        self.defaults.get(key).map(String::as_str)
    }

    /// Stores an already validated value.
    pub fn set(&mut self, key: &str, value: String) {
        self.current.insert(key.to_string(), value);
    }

    /// Restores every variable to its load-time default.
    pub fn reset(&mut self) {
        self.current = self.defaults.clone();
    }

    /// Sorted copy of the current values, for status reporting.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.current
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
