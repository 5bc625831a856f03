//! Top-level error and retry-policy types for the roundwork pipeline domain.
//!
//! [`PipelineError`] covers conditions that terminate the current call. Errors
//! raised inside a phase are [`crate::PhaseError`]s and are wrapped with the
//! phase name, role and client identity before they reach the caller.
//!
//! [`RetryPolicy`] is a cross-cutting concern: the core never retries
//! anything itself, it only tells the orchestrator whether re-issuing the same
//! call is meaningful.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::cache::CacheError;
use crate::phase::PhaseError;
use crate::snapshot::SnapshotViolation;
use crate::{PhaseName, Role};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether a failed call is safe to re-issue with the same request.
///
/// ## Rules
///
/// - `Retryable`: a phase failed while computing; the cache supplied with the
///   request is untouched, so the orchestrator may send the call again.
/// - `NonRetryable`: the request itself, the cache contents, or the phase
///   implementation is wrong. Re-issuing the call produces the same failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The call may be re-issued at the protocol level.
    Retryable,
    /// The call must not be re-issued; the run needs investigation.
    NonRetryable,
}

// ---------------------------------------------------------------------------
// Call-level errors
// ---------------------------------------------------------------------------

/// Errors that abort the current call.
///
/// No variant is ever swallowed: a node either returns a complete response
/// (output plus updated cache) or one of these, in which case no cache
/// mutation from the failed call is handed back.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The request envelope could not be parsed.
    #[error("Malformed request: {message}")]
    MalformedRequest {
        /// Parser diagnostic.
        message: String,
    },

    /// A phase failed during `initialize` or `compute`.
    #[error("Phase '{phase}' failed on {role} node (client '{client_id}'): {source}")]
    PhaseExecution {
        /// The phase that was executing.
        phase: PhaseName,
        /// Role of the node that ran the phase.
        role: Role,
        /// `state.clientId` from the request (may be empty).
        client_id: String,
        /// The phase's own error.
        #[source]
        source: PhaseError,
    },

    /// A phase attempted to overwrite a key of the frozen first-call snapshot.
    ///
    /// Always a programming error in the phase implementation.
    #[error("Frozen snapshot violation in phase '{phase}' on {role} node (client '{client_id}'): {violation}")]
    FrozenSnapshotViolation {
        /// The phase that attempted the write.
        phase: PhaseName,
        /// Role of the node that ran the phase.
        role: Role,
        /// `state.clientId` from the request (may be empty).
        client_id: String,
        /// Details of the refused write.
        violation: SnapshotViolation,
    },

    /// The response could not be represented in the wire format.
    #[error("Response serialization failed: {message}")]
    ResponseSerialization {
        /// Serializer diagnostic.
        message: String,
        /// The output that failed to serialize, attached for diagnosis.
        output: Value,
    },

    /// The pipeline or node configuration is invalid.
    ///
    /// Produced at construction time; a node never starts a call with an
    /// invalid pipeline.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// The cache carried by the request is inconsistent with this pipeline.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl PipelineError {
    /// Creates a [`PipelineError::Configuration`] from a message.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Wraps a phase failure with the identity of the acting party.
    ///
    /// Snapshot violations are promoted to [`PipelineError::FrozenSnapshotViolation`]
    /// so they are never mistaken for a retryable phase failure.
    pub fn from_phase(phase: &PhaseName, role: Role, client_id: &str, error: PhaseError) -> Self {
        match error {
            PhaseError::Snapshot(violation) => Self::FrozenSnapshotViolation {
                phase: phase.clone(),
                role,
                client_id: client_id.to_string(),
                violation,
            },
            source => Self::PhaseExecution {
                phase: phase.clone(),
                role,
                client_id: client_id.to_string(),
                source,
            },
        }
    }

    /// Returns how the orchestrator should treat this failure.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::PhaseExecution { .. } => RetryPolicy::Retryable,
            _ => RetryPolicy::NonRetryable,
        }
    }
}
