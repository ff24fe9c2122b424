// SPDX-License-Identifier: MIT

//! Accumulated analysis state for one session

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Partial update returned by a task
pub type StateUpdate = BTreeMap<String, Value>;

/// Field name to value mapping shared by every task of a session.
///
/// Only the scheduler mutates it; tasks receive a [`StateView`] and return
/// a [`StateUpdate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedState {
    fields: BTreeMap<String, Value>,
}

impl SharedState {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Get a field value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Get a nested field value using dot notation (e.g., "fir_facts.offences_charged")
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    /// A field counts as present when it holds anything but null
    pub fn contains(&self, key: &str) -> bool {
        self.fields.get(key).is_some_and(|v| !v.is_null())
    }

    pub fn has_all<S: AsRef<str>>(&self, keys: &[S]) -> bool {
        keys.iter().all(|k| self.contains(k.as_ref()))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// Apply a task's update
    pub fn merge(&mut self, update: StateUpdate) {
        self.fields.extend(update);
    }

    /// Copy of the named fields only
    pub fn view<S: AsRef<str>>(&self, keys: &[S]) -> StateView {
        StateView {
            fields: keys
                .iter()
                .filter_map(|k| {
                    self.fields
                        .get(k.as_ref())
                        .map(|v| (k.as_ref().to_string(), v.clone()))
                })
                .collect(),
        }
    }

    /// Get all field names
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Convert state to JSON object
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// Read-only slice of the state a task declared it needs
#[derive(Debug, Clone, Default)]
pub struct StateView {
    fields: BTreeMap<String, Value>,
}

impl StateView {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for StateView {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_state() {
        let state = SharedState::empty();
        assert!(state.get("anything").is_none());
        assert!(state.is_empty());
    }

    #[test]
    fn test_null_is_not_present() {
        let mut state = SharedState::empty();
        state.insert("dos", Value::Null);
        state.insert("donts", json!([]));
        assert!(!state.contains("dos"));
        assert!(state.contains("donts"));
        assert!(!state.has_all(&["dos", "donts"]));
    }

    #[test]
    fn test_get_path() {
        let mut state = SharedState::empty();
        state.insert("fir_facts", json!({"search": {"section_50": "complied"}}));

        assert_eq!(
            state.get_path("fir_facts.search.section_50"),
            Some(&json!("complied"))
        );
        assert_eq!(state.get_path("fir_facts.missing"), None);
    }

    #[test]
    fn test_merge_and_view() {
        let mut state = SharedState::empty();
        state.insert("document_text", json!("FIR"));
        state.merge(StateUpdate::from([
            ("a".to_string(), json!(1)),
            ("b".to_string(), json!(2)),
        ]));

        let view = state.view(&["document_text", "b", "missing"]);
        assert_eq!(view.get_str("document_text"), Some("FIR"));
        assert_eq!(view.get("b"), Some(&json!(2)));
        assert!(view.get("a").is_none());
        assert_eq!(view.fields().len(), 2);
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let mut state = SharedState::empty();
        state.insert("a", json!(1));
        assert_eq!(serde_json::to_value(&state).unwrap(), json!({"a": 1}));
        assert_eq!(state.to_json(), json!({"a": 1}));

        let back: SharedState = serde_json::from_value(json!({"a": 1})).unwrap();
        assert_eq!(back, state);
    }
}
