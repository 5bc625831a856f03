//! Phases every pipeline can reuse.

use pipeline::{ComputationPhase, PhaseContext, PhaseError, PhaseOutput};

/// Reports `success: true`; the usual last phase of a remote pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndWithSuccess;

impl ComputationPhase for EndWithSuccess {
    fn compute(&mut self, _ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        Ok(PhaseOutput::new().with_success(true))
    }
}
