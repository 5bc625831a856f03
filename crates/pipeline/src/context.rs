//! What a phase sees while it runs.
//!
//! [`PhaseContext`] binds one phase execution to the call's input, the call's
//! execution state (directories, client id) and the mutable cache. The run's
//! first-call parameters are read through [`PhaseContext::input_args`], never
//! from the live input, which only carries the current round's payload.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::cache::Cache;
use crate::phase::PhaseError;
use crate::snapshot::FrozenSnapshot;
use crate::types::CallState;
use crate::{PhaseName, Role};

/// Execution context handed to [`crate::ComputationPhase`] methods.
pub struct PhaseContext<'a> {
    phase: &'a PhaseName,
    role: Role,
    iteration: u64,
    input: &'a Map<String, Value>,
    state: &'a CallState,
    cache: &'a mut Cache,
}

impl<'a> PhaseContext<'a> {
    /// Binds a phase execution.
    ///
    /// `iteration` is the number of times the pipeline has already resolved
    /// this phase in earlier executions of the run.
    pub fn new(
        phase: &'a PhaseName,
        role: Role,
        iteration: u64,
        input: &'a Map<String, Value>,
        state: &'a CallState,
        cache: &'a mut Cache,
    ) -> Self {
        Self {
            phase,
            role,
            iteration,
            input,
            state,
            cache,
        }
    }

    pub fn phase_name(&self) -> &PhaseName {
        self.phase
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// This call's input: the site's own payload on the local role, the
    /// site-id-keyed previous outputs on the remote role.
    pub fn input(&self) -> &Map<String, Value> {
        self.input
    }

    /// Deserializes a field of this call's input.
    pub fn input_field<T: DeserializeOwned>(&self, key: &str) -> Result<T, PhaseError> {
        let value = self
            .input
            .get(key)
            .ok_or_else(|| PhaseError::MissingInput(key.to_string()))?;
        T::deserialize(value).map_err(|e| PhaseError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    pub fn state(&self) -> &CallState {
        self.state
    }

    pub fn client_id(&self) -> &str {
        &self.state.client_id
    }

    pub fn base_dir(&self) -> &Path {
        &self.state.base_directory
    }

    pub fn out_dir(&self) -> &Path {
        &self.state.output_directory
    }

    pub fn transfer_dir(&self) -> &Path {
        &self.state.transfer_directory
    }

    pub fn cache(&self) -> &Cache {
        self.cache
    }

    pub fn cache_mut(&mut self) -> &mut Cache {
        self.cache
    }

    /// The frozen snapshot of the run's first call input.
    ///
    /// Empty if the node did not capture one (phases driven outside a node).
    pub fn input_args(&self) -> Result<FrozenSnapshot, PhaseError> {
        Ok(self.cache.frozen_snapshot()?.unwrap_or_default())
    }

    /// Deserializes one field of the frozen snapshot.
    pub fn input_arg<T: DeserializeOwned>(&self, key: &str) -> Result<T, PhaseError> {
        let snapshot = self.input_args()?;
        let value = snapshot
            .get(key)
            .ok_or_else(|| PhaseError::MissingInput(key.to_string()))?;
        T::deserialize(value).map_err(|e| PhaseError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Adds a new key to the frozen snapshot.
    ///
    /// # Errors
    ///
    /// [`PhaseError::Snapshot`] if the key is already frozen.
    pub fn freeze(&mut self, key: impl Into<String>, value: Value) -> Result<(), PhaseError> {
        let mut snapshot = self.input_args()?;
        snapshot.try_insert(key, value)?;
        self.cache.store_frozen_snapshot(&snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_input_args_come_from_snapshot_not_live_input() {
        let name = PhaseName::new("vote").unwrap();
        let state = CallState::default();
        let mut cache = Cache::new();
        cache.capture_frozen_snapshot(&object(json!({"data_source": "a.txt"})));
        let live = object(json!({"data_source": "b.txt"}));

        let ctx = PhaseContext::new(&name, Role::Local, 0, &live, &state, &mut cache);
        let from_snapshot: String = ctx.input_arg("data_source").unwrap();
        let from_input: String = ctx.input_field("data_source").unwrap();
        assert_eq!(from_snapshot, "a.txt");
        assert_eq!(from_input, "b.txt");
    }

    #[test]
    fn test_freeze_appends_but_never_overwrites() {
        let name = PhaseName::new("vote").unwrap();
        let state = CallState::default();
        let mut cache = Cache::new();
        cache.capture_frozen_snapshot(&object(json!({"rounds": 2})));
        let input = Map::new();

        let mut ctx = PhaseContext::new(&name, Role::Local, 0, &input, &state, &mut cache);
        ctx.freeze("seed", json!(7)).unwrap();
        let err = ctx.freeze("rounds", json!(5)).unwrap_err();
        assert!(matches!(err, PhaseError::Snapshot(_)));
        assert_eq!(ctx.input_arg::<u64>("seed").unwrap(), 7);
        assert_eq!(ctx.input_arg::<u64>("rounds").unwrap(), 2);
    }

    #[test]
    fn test_missing_and_invalid_fields() {
        let name = PhaseName::new("load").unwrap();
        let state = CallState::default();
        let mut cache = Cache::new();
        let input = object(json!({"data": "not-a-list"}));

        let ctx = PhaseContext::new(&name, Role::Local, 0, &input, &state, &mut cache);
        assert!(matches!(
            ctx.input_field::<Vec<i64>>("absent"),
            Err(PhaseError::MissingInput(ref k)) if k == "absent"
        ));
        assert!(matches!(
            ctx.input_field::<Vec<i64>>("data"),
            Err(PhaseError::InvalidValue { .. })
        ));
    }
}
