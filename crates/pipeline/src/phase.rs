//! The computation phase contract.
//!
//! A phase is one named step of a pipeline. Every call that resolves to a
//! phase gets a fresh instance from the phase's registered factory, so a
//! phase must keep anything it needs across calls in the cache (see
//! [`PhaseContext::cache_mut`]).
//!
//! ```ignore
//! struct SubmitVote;
//!
//! impl ComputationPhase for SubmitVote {
//!     fn initialize(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), PhaseError> {
//!         ctx.cache_mut().set_as("data_index", &0u64)?;
//!         Ok(())
//!     }
//!
//!     fn compute(&mut self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
//!         let index: u64 = ctx.cache().get_as("data_index")?.unwrap_or(0);
//!         ctx.cache_mut().set_as("data_index", &(index + 1))?;
//!         Ok(PhaseOutput::new().with("vote", index % 2 == 0).with_jump_to_next(index >= 9))
//!     }
//! }
//! ```

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::cache::CacheError;
use crate::context::PhaseContext;
use crate::snapshot::SnapshotViolation;
use crate::PhaseName;

/// Output key carrying the advance signal.
pub const JUMP_TO_NEXT_KEY: &str = "jump_to_next";

/// Output key carrying a phase's own success value (read by the remote role).
pub const SUCCESS_KEY: &str = "success";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors a phase returns from [`ComputationPhase::initialize`] or
/// [`ComputationPhase::compute`].
///
/// The node wraps these in [`crate::PipelineError::PhaseExecution`] with the
/// phase name and acting party before surfacing them.
#[derive(Debug, Error)]
pub enum PhaseError {
    /// A field the phase needs is absent from the call input or snapshot.
    #[error("missing input field '{0}'")]
    MissingInput(String),

    /// A field is present but unusable.
    #[error("invalid value for '{key}': {message}")]
    InvalidValue {
        /// The offending field.
        key: String,
        /// Why it was rejected.
        message: String,
    },

    /// The phase tried to overwrite a frozen snapshot key.
    #[error(transparent)]
    Snapshot(#[from] SnapshotViolation),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failure reported by a collaborator outside this crate (e.g. data transfer).
    #[error(transparent)]
    External(Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Free-form failure raised by a phase implementation.
    #[error("{0}")]
    Failed(String),
}

impl PhaseError {
    /// Creates a [`PhaseError::Failed`] from a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Boxes a collaborator's error as [`PhaseError::External`].
    pub fn external(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::External(Box::new(error))
    }
}

// ---------------------------------------------------------------------------
// Output fragment
// ---------------------------------------------------------------------------

/// The result fragment returned by one phase execution.
///
/// An empty fragment is a valid result: a phase with nothing to report
/// returns [`PhaseOutput::new`]. Two keys have meaning to the node:
/// [`JUMP_TO_NEXT_KEY`] (the advance signal) and [`SUCCESS_KEY`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PhaseOutput(Map<String, Value>);

impl PhaseOutput {
    /// Creates an empty fragment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Sets the advance signal.
    pub fn with_jump_to_next(self, jump: bool) -> Self {
        self.with(JUMP_TO_NEXT_KEY, jump)
    }

    /// Sets the phase's success value.
    pub fn with_success(self, success: bool) -> Self {
        self.with(SUCCESS_KEY, success)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Serializes `value` and inserts it under `key`.
    pub fn insert_serialized<T: Serialize + ?Sized>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), PhaseError> {
        self.0.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Merges every entry of `other` into this fragment; `other` wins on conflicts.
    pub fn merge(&mut self, other: PhaseOutput) {
        self.0.extend(other.0);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `true` only if the fragment carries `jump_to_next: true`.
    pub fn jump_to_next(&self) -> bool {
        matches!(self.0.get(JUMP_TO_NEXT_KEY), Some(Value::Bool(true)))
    }

    /// The phase's `success` value; absent or non-boolean counts as `false`.
    pub fn success(&self) -> bool {
        matches!(self.0.get(SUCCESS_KEY), Some(Value::Bool(true)))
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for PhaseOutput {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// ---------------------------------------------------------------------------
// Phase trait
// ---------------------------------------------------------------------------

/// One named, orderable computation step.
pub trait ComputationPhase: Send {
    /// Runs exactly once per phase per run, before the first `compute`.
    ///
    /// Gated by the `PHASE:<name>` cache flag; the default does nothing.
    fn initialize(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), PhaseError> {
        let _ = ctx;
        Ok(())
    }

    /// Runs on every call that resolves to this phase.
    fn compute(&mut self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseError>;
}

/// Produces a fresh phase instance for each call.
pub type PhaseFactory = Box<dyn Fn() -> Box<dyn ComputationPhase> + Send + Sync>;

/// Per-phase flags fixed at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseOptions {
    /// The phase stays resident across calls until the advance signal is set.
    pub multi_iteration: bool,
    /// The phase runs in the same call in which the pipeline advances into it.
    pub local_only: bool,
}

/// A registered phase: its name, factory and flags.
pub struct PhaseRegistration {
    name: PhaseName,
    factory: PhaseFactory,
    options: PhaseOptions,
}

impl PhaseRegistration {
    pub(crate) fn new(name: PhaseName, factory: PhaseFactory, options: PhaseOptions) -> Self {
        Self {
            name,
            factory,
            options,
        }
    }

    pub fn name(&self) -> &PhaseName {
        &self.name
    }

    pub fn options(&self) -> PhaseOptions {
        self.options
    }

    pub fn is_multi_iteration(&self) -> bool {
        self.options.multi_iteration
    }

    pub fn is_local_only(&self) -> bool {
        self.options.local_only
    }

    /// Instantiates the phase and runs it against `ctx`.
    ///
    /// The one-time initializer runs first if the phase's cache flag is not
    /// set yet; the flag is only set once the initializer succeeded.
    pub fn execute(&self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        let mut phase = (self.factory)();
        if !ctx.cache().is_phase_initialized(&self.name) {
            tracing::debug!(phase = %self.name, "Running one-time phase initialization");
            phase.initialize(ctx)?;
            ctx.cache_mut().mark_phase_initialized(&self.name);
        }
        phase.compute(ctx)
    }
}

impl std::fmt::Debug for PhaseRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseRegistration")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
