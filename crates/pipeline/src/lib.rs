//! Core phase-pipeline domain for roundwork.
//!
//! A run is a sequence of independent, stateless calls (one per round per
//! party). This crate contains everything needed to resume an ordered
//! sequence of computation phases correctly across those calls using nothing
//! but the caller-owned [`Cache`].
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! Role-specific orchestration lives in the `nodes` crate; transports live in
//! `listener` and `cli`.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`PhaseName`, `SiteId`, `CallId`) and [`Role`] |
//! | [`types`] | Call envelope (`CallRequest`, `CallState`, `CallResponse`) and `Timestamp` |
//! | [`errors`] | Top-level error and retry-policy types |
//! | [`cache`] | The round-tripped cache and its typed bookkeeping accessors |
//! | [`snapshot`] | The append-only frozen snapshot of the first call's input |
//! | [`phase`] | The `ComputationPhase` contract, output fragments, registrations |
//! | [`context`] | `PhaseContext`, what a phase sees while it runs |
//! | [`pipeline`] | The ordered registry and its resolution state machine |

pub mod cache;
pub mod context;
pub mod errors;
pub mod identifiers;
pub mod phase;
pub mod pipeline;
pub mod snapshot;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use cache::{Cache, CacheError};
pub use context::PhaseContext;
pub use errors::{PipelineError, RetryPolicy};
pub use identifiers::{CallId, PhaseName, Role, SiteId};
pub use phase::{
    ComputationPhase, PhaseError, PhaseFactory, PhaseOptions, PhaseOutput, PhaseRegistration,
    JUMP_TO_NEXT_KEY, SUCCESS_KEY,
};
pub use pipeline::{AdvancePolicy, Pipeline, PipelineBuilder, PipelineState};
pub use snapshot::{FrozenSnapshot, SnapshotViolation};
pub use types::{CallRequest, CallResponse, CallState, Timestamp};
