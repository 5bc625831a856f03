//! The phase pipeline: an ordered phase registry and its resolution state machine.
//!
//! The pipeline is a deterministic cursor into the registered phase sequence.
//! There is no separate "not started" state: a fresh [`PipelineState`] points
//! at index 0 with every iteration counter at 0.
//!
//! ## Transition rule
//!
//! [`Pipeline::next_phase`] is invoked once per phase execution, after the
//! phase's `compute` returned:
//!
//! 1. the current phase's iteration counter is incremented;
//! 2. the cursor advances by one (capped at the last phase) iff the advance
//!    signal is set or the current phase is not multi-iteration;
//! 3. the phase now under the cursor is returned.
//!
//! Under [`AdvancePolicy::ExplicitSignalOnly`] step 2 only honours the
//! advance signal.
//!
//! The pipeline holds no call state of its own. [`PipelineState`] is loaded
//! from and committed to the [`Cache`] on every call, so a pipeline may be
//! rebuilt from scratch for every invocation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cache::{pipeline_state_key, Cache, CacheError, NEXT_PHASE_KEY};
use crate::errors::PipelineError;
use crate::phase::{ComputationPhase, PhaseFactory, PhaseOptions, PhaseRegistration};
use crate::{PhaseName, Role};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Resumable cursor, persisted in the cache under `PIPELINE:<ROLE>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    current_index: usize,
    #[serde(default)]
    iteration_counts: BTreeMap<String, u64>,
}

impl PipelineState {
    /// Index 0, all counters at 0.
    pub fn initial() -> Self {
        Self::default()
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// How many times `phase` has been resolved so far.
    pub fn iterations(&self, phase: &PhaseName) -> u64 {
        self.iteration_counts.get(phase.as_str()).copied().unwrap_or(0)
    }
}

/// Whether single-iteration phases advance without an explicit signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdvancePolicy {
    /// A phase that is not multi-iteration always advances after one execution.
    #[default]
    SingleIterationAlwaysAdvances,
    /// Every phase stays resident until the advance signal is set.
    ExplicitSignalOnly,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects phase registrations in execution order.
///
/// Registration order is the execution order and is fixed by [`PipelineBuilder::build`].
pub struct PipelineBuilder {
    role: Role,
    phases: Vec<(String, PhaseFactory, PhaseOptions)>,
    policy: AdvancePolicy,
}

impl PipelineBuilder {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            phases: Vec::new(),
            policy: AdvancePolicy::default(),
        }
    }

    /// Registers a single-iteration phase.
    pub fn phase<F, P>(self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: ComputationPhase + 'static,
    {
        self.phase_with(name, factory, PhaseOptions::default())
    }

    /// Registers a phase that stays resident until the advance signal is set.
    pub fn multi_iteration_phase<F, P>(self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: ComputationPhase + 'static,
    {
        let options = PhaseOptions {
            multi_iteration: true,
            local_only: false,
        };
        self.phase_with(name, factory, options)
    }

    /// Registers a phase executed in the same call the pipeline advances into it.
    pub fn local_only_phase<F, P>(self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: ComputationPhase + 'static,
    {
        let options = PhaseOptions {
            multi_iteration: false,
            local_only: true,
        };
        self.phase_with(name, factory, options)
    }

    /// Registers a phase with explicit flags.
    pub fn phase_with<F, P>(mut self, name: impl Into<String>, factory: F, options: PhaseOptions) -> Self
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: ComputationPhase + 'static,
    {
        let factory: PhaseFactory = Box::new(move || Box::new(factory()) as Box<dyn ComputationPhase>);
        self.phases.push((name.into(), factory, options));
        self
    }

    pub fn advance_policy(mut self, policy: AdvancePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Freezes the registration order.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Configuration`] if no phase is registered, a name is
    /// empty, or a name is registered twice.
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        if self.phases.is_empty() {
            return Err(PipelineError::configuration(format!(
                "{} pipeline has no phases registered",
                self.role
            )));
        }

        let mut phases: Vec<PhaseRegistration> = Vec::with_capacity(self.phases.len());
        for (raw, factory, options) in self.phases {
            let name = PhaseName::new(raw)
                .ok_or_else(|| PipelineError::configuration("phase names must not be empty"))?;
            if phases.iter().any(|p| p.name() == &name) {
                return Err(PipelineError::configuration(format!(
                    "phase '{name}' is registered more than once"
                )));
            }
            phases.push(PhaseRegistration::new(name, factory, options));
        }

        Ok(Pipeline {
            role: self.role,
            phases,
            policy: self.policy,
        })
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// An immutable, ordered phase registry for one role.
#[derive(Debug)]
pub struct Pipeline {
    role: Role,
    phases: Vec<PhaseRegistration>,
    policy: AdvancePolicy,
}

impl Pipeline {
    pub fn builder(role: Role) -> PipelineBuilder {
        PipelineBuilder::new(role)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn advance_policy(&self) -> AdvancePolicy {
        self.policy
    }

    /// Number of registered phases (never zero).
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn phases(&self) -> &[PhaseRegistration] {
        &self.phases
    }

    /// Registration index of `name`.
    pub fn position(&self, name: &PhaseName) -> Option<usize> {
        self.phases.iter().position(|p| p.name() == name)
    }

    /// The phase under the cursor of `state`.
    pub fn current(&self, state: &PipelineState) -> &PhaseRegistration {
        &self.phases[state.current_index.min(self.phases.len() - 1)]
    }

    /// Loads this role's pipeline state from `cache`, or the initial state on
    /// the first call of a run.
    ///
    /// # Errors
    ///
    /// [`CacheError::Corrupted`] if the stored entry is malformed or its
    /// cursor lies outside this pipeline.
    pub fn load_state(&self, cache: &Cache) -> Result<PipelineState, PipelineError> {
        let state = cache.pipeline_state(self.role)?.unwrap_or_default();
        if state.current_index >= self.phases.len() {
            return Err(CacheError::Corrupted {
                key: pipeline_state_key(self.role),
                message: format!(
                    "cursor {} is outside a pipeline of {} phases",
                    state.current_index,
                    self.phases.len()
                ),
            }
            .into());
        }
        Ok(state)
    }

    /// Resolves the phase the current call runs.
    ///
    /// This is the cached `next_phase` if present, which must agree with the
    /// cursor of `state`; otherwise the phase under the cursor (index 0 on the
    /// first call).
    pub fn resolve(&self, cache: &Cache, state: &PipelineState) -> Result<&PhaseRegistration, PipelineError> {
        let Some(name) = cache.next_phase()? else {
            return Ok(self.current(state));
        };
        match self.position(&name) {
            Some(index) if index == state.current_index => Ok(&self.phases[index]),
            Some(index) => Err(CacheError::Corrupted {
                key: NEXT_PHASE_KEY.to_string(),
                message: format!(
                    "next phase '{name}' (index {index}) disagrees with pipeline cursor {}",
                    state.current_index
                ),
            }
            .into()),
            None => Err(CacheError::Corrupted {
                key: NEXT_PHASE_KEY.to_string(),
                message: format!("phase '{name}' is not registered in the {} pipeline", self.role),
            }
            .into()),
        }
    }

    /// Applies the transition rule and returns the phase now under the cursor.
    pub fn next_phase(&self, state: &mut PipelineState, force_jump: bool) -> &PhaseRegistration {
        let index = state.current_index.min(self.phases.len() - 1);
        let current = &self.phases[index];
        *state
            .iteration_counts
            .entry(current.name().as_str().to_string())
            .or_insert(0) += 1;

        let advance = match self.policy {
            AdvancePolicy::SingleIterationAlwaysAdvances => force_jump || !current.is_multi_iteration(),
            AdvancePolicy::ExplicitSignalOnly => force_jump,
        };
        if advance {
            state.current_index = (index + 1).min(self.phases.len() - 1);
        }

        let next = &self.phases[state.current_index];
        tracing::debug!(
            role = %self.role,
            from = %current.name(),
            to = %next.name(),
            force_jump,
            advanced = state.current_index != index,
            "Pipeline transition"
        );
        next
    }

    /// Writes `state` and the resolved next phase back into `cache`.
    pub fn commit(&self, cache: &mut Cache, state: &PipelineState) -> Result<(), PipelineError> {
        cache.store_pipeline_state(self.role, state)?;
        cache.set_next_phase(self.current(state).name());
        Ok(())
    }
}
