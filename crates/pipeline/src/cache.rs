//! The caller-owned cache: the only state that survives between calls.
//!
//! On the wire the cache is an opaque JSON object. The node reads it in full
//! at the start of a call and hands it back in full at the end; the
//! orchestrator persists it verbatim and returns it with the next call.
//!
//! Bookkeeping entries live under reserved keys and are only reachable
//! through typed accessors:
//!
//! | Key | Contents |
//! |-----|----------|
//! | `PIPELINE:<ROLE>` | [`crate::PipelineState`] (cursor and iteration counters) |
//! | `PHASE:<name>` | one-time initialization flag of a phase |
//! | `next_phase` | name of the phase the next call resolves to |
//! | `input_args` | [`FrozenSnapshot`] of the first call's input |
//!
//! Phases own every other key and use [`Cache::get_as`] / [`Cache::set_as`]
//! for their cross-call state. Writes to reserved keys through the free-form
//! API are refused with [`CacheError::ReservedKey`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::pipeline::PipelineState;
use crate::snapshot::FrozenSnapshot;
use crate::{PhaseName, Role};

/// Cache key of the phase the next call resolves to.
pub const NEXT_PHASE_KEY: &str = "next_phase";

/// Cache key of the frozen first-call snapshot.
pub const FROZEN_SNAPSHOT_KEY: &str = "input_args";

const PHASE_PREFIX: &str = "PHASE:";
const PIPELINE_PREFIX: &str = "PIPELINE:";

/// Errors raised while reading or writing cache entries.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheError {
    /// A typed entry exists but does not have the expected shape.
    #[error("Cache entry '{key}' is corrupted: {message}")]
    Corrupted {
        /// The offending key.
        key: String,
        /// Why the entry was rejected.
        message: String,
    },

    /// A value could not be converted to JSON for storage.
    #[error("Cache entry '{key}' could not be serialized: {message}")]
    Serialization {
        /// The key being written.
        key: String,
        /// Serializer diagnostic.
        message: String,
    },

    /// Free-form access attempted to write a bookkeeping key.
    #[error("Cache key '{key}' is reserved for pipeline bookkeeping")]
    ReservedKey {
        /// The reserved key.
        key: String,
    },
}

/// Returns `true` if `key` is used for pipeline bookkeeping.
pub fn is_reserved_key(key: &str) -> bool {
    key == NEXT_PHASE_KEY
        || key == FROZEN_SNAPSHOT_KEY
        || key.starts_with(PHASE_PREFIX)
        || key.starts_with(PIPELINE_PREFIX)
}

/// Key of the one-time initialization flag of `phase`.
pub fn phase_flag_key(phase: &PhaseName) -> String {
    format!("{PHASE_PREFIX}{phase}")
}

/// Key of the pipeline state for `role`.
pub fn pipeline_state_key(role: Role) -> String {
    format!("{PIPELINE_PREFIX}{role}")
}

/// String-keyed store of JSON values, round-tripped by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cache(Map<String, Value>);

impl Cache {
    /// Creates an empty cache, as supplied on the first call of a run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a cache object received from the caller.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Unwraps the cache for handing back to the caller.
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Returns the raw value stored under `key`, reserved keys included.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Reads and deserializes the entry stored under `key`.
    ///
    /// Returns `Ok(None)` if the key is absent or holds `null`.
    ///
    /// # Errors
    ///
    /// [`CacheError::Corrupted`] if the entry does not deserialize into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => T::deserialize(value).map(Some).map_err(|e| CacheError::Corrupted {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Stores `value` under a phase-owned key, returning the previous value.
    ///
    /// # Errors
    ///
    /// [`CacheError::ReservedKey`] if `key` is a bookkeeping key.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Result<Option<Value>, CacheError> {
        let key = key.into();
        if is_reserved_key(&key) {
            return Err(CacheError::ReservedKey { key });
        }
        Ok(self.0.insert(key, value))
    }

    /// Serializes and stores `value` under a phase-owned key.
    pub fn set_as<T: Serialize + ?Sized>(&mut self, key: impl Into<String>, value: &T) -> Result<(), CacheError> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|e| CacheError::Serialization {
            key: key.clone(),
            message: e.to_string(),
        })?;
        self.set(key, value).map(|_| ())
    }

    /// Removes a phase-owned entry.
    pub fn remove(&mut self, key: &str) -> Result<Option<Value>, CacheError> {
        if is_reserved_key(key) {
            return Err(CacheError::ReservedKey { key: key.to_string() });
        }
        Ok(self.0.remove(key))
    }

    // -----------------------------------------------------------------------
    // Typed bookkeeping accessors
    // -----------------------------------------------------------------------

    /// Returns `true` once `phase` has completed its one-time initialization.
    pub fn is_phase_initialized(&self, phase: &PhaseName) -> bool {
        matches!(self.0.get(&phase_flag_key(phase)), Some(Value::Bool(true)))
    }

    /// Records that `phase` has been initialized. The flag is never cleared.
    pub fn mark_phase_initialized(&mut self, phase: &PhaseName) {
        self.0.insert(phase_flag_key(phase), Value::Bool(true));
    }

    /// Name of the phase the next call resolves to, if any call completed yet.
    pub fn next_phase(&self) -> Result<Option<PhaseName>, CacheError> {
        match self.get_as::<String>(NEXT_PHASE_KEY)? {
            None => Ok(None),
            Some(name) => PhaseName::new(name).map(Some).ok_or_else(|| CacheError::Corrupted {
                key: NEXT_PHASE_KEY.to_string(),
                message: "empty phase name".to_string(),
            }),
        }
    }

    pub fn set_next_phase(&mut self, phase: &PhaseName) {
        self.0
            .insert(NEXT_PHASE_KEY.to_string(), Value::String(phase.as_str().to_string()));
    }

    /// Stored pipeline state for `role`.
    pub fn pipeline_state(&self, role: Role) -> Result<Option<PipelineState>, CacheError> {
        self.get_as(&pipeline_state_key(role))
    }

    pub fn store_pipeline_state(&mut self, role: Role, state: &PipelineState) -> Result<(), CacheError> {
        let key = pipeline_state_key(role);
        let value = serde_json::to_value(state).map_err(|e| CacheError::Serialization {
            key: key.clone(),
            message: e.to_string(),
        })?;
        self.0.insert(key, value);
        Ok(())
    }

    /// The frozen first-call snapshot, if it has been captured.
    pub fn frozen_snapshot(&self) -> Result<Option<FrozenSnapshot>, CacheError> {
        self.get_as(FROZEN_SNAPSHOT_KEY)
    }

    /// Captures `input` as the frozen snapshot unless one already exists.
    ///
    /// Returns `true` if the snapshot was captured by this call.
    pub fn capture_frozen_snapshot(&mut self, input: &Map<String, Value>) -> bool {
        if self.0.contains_key(FROZEN_SNAPSHOT_KEY) {
            return false;
        }
        self.0
            .insert(FROZEN_SNAPSHOT_KEY.to_string(), Value::Object(input.clone()));
        true
    }

    /// Replaces the stored snapshot after an append-only update.
    pub(crate) fn store_frozen_snapshot(&mut self, snapshot: &FrozenSnapshot) {
        self.0.insert(
            FROZEN_SNAPSHOT_KEY.to_string(),
            Value::Object(snapshot.as_map().clone()),
        );
    }
}

impl From<Map<String, Value>> for Cache {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn name(s: &str) -> PhaseName {
        PhaseName::new(s).unwrap()
    }

    #[test]
    fn test_reserved_keys_are_refused() {
        let mut cache = Cache::new();
        for key in ["next_phase", "input_args", "PHASE:collect", "PIPELINE:LOCAL"] {
            assert_eq!(
                cache.set(key, json!(1)),
                Err(CacheError::ReservedKey { key: key.to_string() })
            );
        }
        assert!(cache.remove("next_phase").is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_typed_round_trip() {
        let mut cache = Cache::new();
        cache.set_as("ballot", &vec![[2u32, 1u32]]).unwrap();
        let ballot: Vec<[u32; 2]> = cache.get_as("ballot").unwrap().unwrap();
        assert_eq!(ballot, vec![[2, 1]]);
        assert_eq!(cache.get_as::<u32>("missing").unwrap(), None);
    }

    #[test]
    fn test_corrupted_entry_reports_key() {
        let mut cache = Cache::new();
        cache.set("data_index", json!("three")).unwrap();
        let err = cache.get_as::<u64>("data_index").unwrap_err();
        assert!(matches!(err, CacheError::Corrupted { ref key, .. } if key == "data_index"));
    }

    #[test]
    fn test_phase_flag_is_namespaced() {
        let mut cache = Cache::new();
        let collect = name("collect");
        assert!(!cache.is_phase_initialized(&collect));
        cache.mark_phase_initialized(&collect);
        assert!(cache.is_phase_initialized(&collect));
        assert_eq!(cache.get("PHASE:collect"), Some(&json!(true)));
        assert!(!cache.is_phase_initialized(&name("other")));
    }

    #[test]
    fn test_capture_snapshot_only_once() {
        let mut cache = Cache::new();
        let first = match json!({"rounds": 3}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let second = match json!({"rounds": 7}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        assert!(cache.capture_frozen_snapshot(&first));
        assert!(!cache.capture_frozen_snapshot(&second));
        let snapshot = cache.frozen_snapshot().unwrap().unwrap();
        assert_eq!(snapshot.get("rounds"), Some(&json!(3)));
    }

    #[test]
    fn test_next_phase_round_trip() {
        let mut cache = Cache::new();
        assert_eq!(cache.next_phase().unwrap(), None);
        cache.set_next_phase(&name("save"));
        assert_eq!(cache.next_phase().unwrap(), Some(name("save")));
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let mut cache = Cache::new();
        cache.set("user_key", json!([1, 2])).unwrap();
        cache.mark_phase_initialized(&name("load"));
        assert_eq!(
            serde_json::to_value(&cache).unwrap(),
            json!({"user_key": [1, 2], "PHASE:load": true})
        );
    }
}
