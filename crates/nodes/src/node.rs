//! Per-role call handling.
//!
//! A [`Node`] translates one external call into one phase execution (or more,
//! when the pipeline advances into local-only phases) and shapes the response
//! envelope. It keeps nothing between calls: build a fresh node per call, or
//! share one across calls, the result is the same because every piece of
//! cross-call state travels in the request's cache.
//!
//! ## Algorithm per call
//!
//! 1. Capture the frozen snapshot if the cache has none (first call of a run).
//! 2. Load the pipeline cursor and resolve the phase to run.
//! 3. Local role only: if the input carries `jump_to_next: true` (the remote
//!    told its sites to move on), force-advance before resolving.
//! 4. Execute the phase (one-time initialization first, then `compute`).
//! 5. Derive the advance signal: the phase's own flag, or on the remote role
//!    the unanimous `jump_to_next` of every site in the input.
//! 6. Apply the transition rule and commit cursor and `next_phase` to the cache.
//! 7. If the pipeline just moved into a local-only phase, go back to 4 within
//!    the same call, at most once per registered phase.
//! 8. Remote role only: report the executed phase's own `success`.

use pipeline::{
    CallId, CallRequest, CallResponse, CallState, Cache, PhaseContext, PhaseOutput,
    PhaseRegistration, Pipeline, PipelineError, PipelineState, Role, JUMP_TO_NEXT_KEY,
};
use serde_json::{Map, Value};

use crate::call_log::{self, CallRecord};

/// Node behaviour switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeOptions {
    /// Append a timestamped record of every call to
    /// `<outputDirectory>/<ROLE>_<clientId>_logs.txt`.
    pub debug_log: bool,
}

/// The entry point of one party (local site or remote aggregator).
#[derive(Debug)]
pub struct Node {
    pipeline: Pipeline,
    options: NodeOptions,
}

impl Node {
    /// Creates a node for the role the pipeline was built for.
    pub fn new(pipeline: Pipeline) -> Self {
        Self::with_options(pipeline, NodeOptions::default())
    }

    pub fn with_options(pipeline: Pipeline, options: NodeOptions) -> Self {
        Self { pipeline, options }
    }

    pub fn role(&self) -> Role {
        self.pipeline.role()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Handles one call.
    ///
    /// The cache in the returned response replaces the one supplied with the
    /// request. On error no cache is returned, so nothing from the failed call
    /// can be persisted.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::PhaseExecution`] if a phase failed.
    /// - [`PipelineError::FrozenSnapshotViolation`] if a phase tried to
    ///   overwrite a frozen key.
    /// - [`PipelineError::Cache`] if the supplied cache does not belong to
    ///   this pipeline.
    pub fn compute(&self, request: CallRequest) -> Result<CallResponse, PipelineError> {
        let role = self.role();
        let call_id = CallId::new_random();
        let span = tracing::info_span!(
            "node_call",
            %role,
            client_id = %request.state.client_id,
            %call_id
        );
        let _guard = span.enter();

        let CallRequest {
            input,
            state,
            mut cache,
        } = request;
        let cache_before = self.options.debug_log.then(|| cache.clone());

        if cache.capture_frozen_snapshot(&input) {
            tracing::debug!("Captured frozen snapshot of first call input");
        }

        let mut cursor = self.pipeline.load_state(&cache)?;
        let mut phase = self.pipeline.resolve(&cache, &cursor)?;

        if role == Role::Local && remote_directed_jump(&input) {
            phase = self.pipeline.next_phase(&mut cursor, true);
            tracing::info!(phase = %phase.name(), "Remote requested advance");
        }

        // At most one execution per registered phase.
        let mut executions = 0;
        let mut output = PhaseOutput::new();
        for _ in 0..self.pipeline.len() {
            executions += 1;
            output = self.execute(phase, &cursor, &input, &state, &mut cache)?;
            let advance = self.advance_signal(&output, &input);

            let before = cursor.current_index();
            let next = self.pipeline.next_phase(&mut cursor, advance);
            self.pipeline.commit(&mut cache, &cursor)?;

            if cursor.current_index() == before || !next.is_local_only() {
                break;
            }
            tracing::debug!(phase = %next.name(), "Chaining local-only phase");
            phase = next;
        }

        let response = CallResponse {
            success: (role == Role::Remote).then(|| output.success()),
            output: output.into_map(),
            cache,
        };
        tracing::info!(
            next_phase = %self.pipeline.current(&cursor).name(),
            executions,
            "Call complete"
        );

        if let Some(cache_before) = cache_before {
            let record = CallRecord {
                input: &input,
                cache_before: &cache_before,
                response: &response,
            };
            if let Err(e) = call_log::append(&state, role, &record) {
                tracing::warn!(error = %e, "Failed to write debug call log");
            }
        }

        Ok(response)
    }

    fn execute(
        &self,
        phase: &PhaseRegistration,
        cursor: &PipelineState,
        input: &Map<String, Value>,
        state: &CallState,
        cache: &mut Cache,
    ) -> Result<PhaseOutput, PipelineError> {
        let role = self.role();
        let span = tracing::info_span!("phase", phase = %phase.name());
        let _guard = span.enter();

        let iteration = cursor.iterations(phase.name());
        let mut ctx = PhaseContext::new(phase.name(), role, iteration, input, state, cache);
        phase.execute(&mut ctx).map_err(|e| {
            let err = PipelineError::from_phase(phase.name(), role, &state.client_id, e);
            tracing::error!(error = %err, "Phase failed");
            err
        })
    }

    fn advance_signal(&self, output: &PhaseOutput, input: &Map<String, Value>) -> bool {
        match self.role() {
            Role::Local => output.jump_to_next(),
            Role::Remote => output.jump_to_next() || all_sites_ready(input),
        }
    }
}

/// `true` if every site in a remote call's input reported `jump_to_next: true`.
///
/// A site that omits the flag, or whose entry is not an object, is not ready.
/// An input with no sites is never ready.
pub fn all_sites_ready(input: &Map<String, Value>) -> bool {
    !input.is_empty()
        && input
            .values()
            .all(|site| matches!(site.get(JUMP_TO_NEXT_KEY), Some(Value::Bool(true))))
}

fn remote_directed_jump(input: &Map<String, Value>) -> bool {
    matches!(input.get(JUMP_TO_NEXT_KEY), Some(Value::Bool(true)))
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
    fn test_all_sites_ready_requires_every_site() {
        assert!(all_sites_ready(&object(json!({
            "site1": {"jump_to_next": true},
            "site2": {"jump_to_next": true},
        }))));
        assert!(!all_sites_ready(&object(json!({
            "site1": {"jump_to_next": true},
            "site2": {"vote": true},
        }))));
        assert!(!all_sites_ready(&object(json!({
            "site1": {"jump_to_next": "true"},
        }))));
    }

    #[test]
    fn test_empty_or_malformed_sites_are_not_ready() {
        assert!(!all_sites_ready(&Map::new()));
        assert!(!all_sites_ready(&object(json!({"site1": [true]}))));
    }

    #[test]
    fn test_remote_directed_jump_reads_top_level_flag() {
        assert!(remote_directed_jump(&object(json!({"jump_to_next": true}))));
        assert!(!remote_directed_jump(&object(json!({"jump_to_next": false}))));
        assert!(!remote_directed_jump(&object(json!({"data": {"jump_to_next": true}}))));
    }
}
