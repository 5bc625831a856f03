//! The frozen snapshot of a run's first call input.
//!
//! Multi-iteration phases frequently need the configuration that arrived with
//! the very first call (file names, round limits, seeds), while later calls
//! only carry the current round's payload. The node captures that first input
//! once, and phases read it through [`FrozenSnapshot`] for the rest of the run.
//!
//! The snapshot is append-only: new keys may be added, existing keys can
//! never be replaced. A refused write is reported as a [`SnapshotViolation`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A refused attempt to overwrite a key already held by a [`FrozenSnapshot`].
#[derive(Debug, Clone, PartialEq, Error)]
#[error("attempt to modify frozen key [{key} : {existing}] with [{key} : {attempted}]")]
pub struct SnapshotViolation {
    /// The key that was already present.
    pub key: String,
    /// The value held by the snapshot.
    pub existing: Value,
    /// The value the caller tried to store.
    pub attempted: Value,
}

/// Immutable capture of the first call's input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrozenSnapshot(Map<String, Value>);

impl FrozenSnapshot {
    /// Captures a deep copy of `input`.
    pub fn capture(input: &Map<String, Value>) -> Self {
        Self(input.clone())
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Read-only view of every captured entry.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Adds `key` if it is not present yet.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotViolation`] if `key` is already held, regardless of
    /// whether the new value equals the existing one.
    pub fn try_insert(&mut self, key: impl Into<String>, value: Value) -> Result<(), SnapshotViolation> {
        let key = key.into();
        if let Some(existing) = self.0.get(&key) {
            return Err(SnapshotViolation {
                key,
                existing: existing.clone(),
                attempted: value,
            });
        }
        self.0.insert(key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input() -> Map<String, Value> {
        match json!({"data_source": "votes.txt", "rounds": 3}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_capture_is_a_copy() {
        let mut original = input();
        let snapshot = FrozenSnapshot::capture(&original);
        original.insert("rounds".into(), json!(99));
        assert_eq!(snapshot.get("rounds"), Some(&json!(3)));
    }

    #[test]
    fn test_insert_new_key_succeeds() {
        let mut snapshot = FrozenSnapshot::capture(&input());
        snapshot.try_insert("seed", json!(42)).unwrap();
        assert_eq!(snapshot.get("seed"), Some(&json!(42)));
        assert_eq!(snapshot.len(), 3);
    }

    #[test]
    fn test_overwrite_existing_key_fails() {
        let mut snapshot = FrozenSnapshot::capture(&input());
        let err = snapshot.try_insert("rounds", json!(4)).unwrap_err();
        assert_eq!(err.key, "rounds");
        assert_eq!(err.existing, json!(3));
        assert_eq!(err.attempted, json!(4));
        assert_eq!(snapshot.get("rounds"), Some(&json!(3)));
    }

    #[test]
    fn test_rewriting_same_value_still_fails() {
        let mut snapshot = FrozenSnapshot::capture(&input());
        assert!(snapshot.try_insert("rounds", json!(3)).is_err());
    }
}
