//! Demo pipelines shipped with the binary.
//!
//! | Name | Local role | Remote role |
//! |------|------------|-------------|
//! | `max-even` | keep even numbers of `input.data`; save the aggregate | collect each site's maximum |
//! | `vote` | vote once per value in the frozen `data_source` file | tally rounds, then publish the result in the same call |
//! | `average` | send `input.matrix` as a transfer file; save the average | average every site's matrix element-wise |
//!
//! Every remote pipeline ends with [`EndWithSuccess`].

use std::fs;

use clap::ValueEnum;
use nodes::EndWithSuccess;
use pipeline::{
    AdvancePolicy, ComputationPhase, PhaseContext, PhaseError, PhaseOutput, Pipeline,
    PipelineError, Role,
};
use serde_json::Value;

/// The pipelines the binary can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DemoPipeline {
    /// Maximum even value per site.
    MaxEven,
    /// Multi-round majority vote.
    Vote,
    /// Element-wise matrix average over transfer files.
    Average,
}

/// Builds the named pipeline for `role`.
pub fn build(demo: DemoPipeline, role: Role, policy: AdvancePolicy) -> Result<Pipeline, PipelineError> {
    let builder = Pipeline::builder(role).advance_policy(policy);
    let builder = match (demo, role) {
        (DemoPipeline::MaxEven, Role::Local) => builder
            .phase("filter_even", || FilterEven)
            .phase("save_result", || SaveAggregate),
        (DemoPipeline::MaxEven, Role::Remote) => builder
            .phase("collect_max_even", || CollectMaxEven)
            .phase("end", || EndWithSuccess),
        (DemoPipeline::Vote, Role::Local) => builder
            .multi_iteration_phase("submit_vote", || SubmitVote)
            .phase("save_result", || SaveVoteResult),
        (DemoPipeline::Vote, Role::Remote) => builder
            .multi_iteration_phase("collect_vote", || CollectVote)
            .local_only_phase("send_global_results", || SendGlobalResults)
            .phase("end", || EndWithSuccess),
        (DemoPipeline::Average, Role::Local) => builder
            .phase("send_matrix", || SendMatrix)
            .phase("save_result", || SaveAverage),
        (DemoPipeline::Average, Role::Remote) => builder
            .phase("aggregate_matrix", || AggregateMatrix)
            .phase("end", || EndWithSuccess),
    };
    builder.build()
}

// ---------------------------------------------------------------------------
// max-even
// ---------------------------------------------------------------------------

struct FilterEven;

impl ComputationPhase for FilterEven {
    fn compute(&mut self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        let data: Vec<i64> = ctx.input_field("data")?;
        let even: Vec<i64> = data.into_iter().filter(|d| d % 2 == 0).collect();
        Ok(PhaseOutput::new().with("filtered_data", even))
    }
}

struct SaveAggregate;

impl ComputationPhase for SaveAggregate {
    fn compute(&mut self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        let aggregated: Value = ctx.input_field("aggregated_data")?;
        fs::write(ctx.out_dir().join("results.txt"), aggregated.to_string())?;
        Ok(PhaseOutput::new())
    }
}

struct CollectMaxEven;

impl ComputationPhase for CollectMaxEven {
    fn compute(&mut self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        let mut maxima = Vec::with_capacity(ctx.input().len());
        for (site, output) in ctx.input() {
            let filtered: Vec<i64> = output
                .get("filtered_data")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .ok_or_else(|| PhaseError::MissingInput(format!("{site}.filtered_data")))?;
            let max = filtered.into_iter().max().ok_or_else(|| PhaseError::InvalidValue {
                key: format!("{site}.filtered_data"),
                message: "site reported no even values".to_string(),
            })?;
            maxima.push(max);
        }
        Ok(PhaseOutput::new().with("aggregated_data", maxima))
    }
}

// ---------------------------------------------------------------------------
// vote
// ---------------------------------------------------------------------------

struct SubmitVote;

impl ComputationPhase for SubmitVote {
    fn initialize(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), PhaseError> {
        let source: String = ctx.input_arg("data_source")?;
        let raw = fs::read_to_string(ctx.base_dir().join(&source))?;
        let mut data = Vec::new();
        for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let value: f64 = line.parse().map_err(|_| PhaseError::InvalidValue {
                key: source.clone(),
                message: format!("'{line}' is not a number"),
            })?;
            data.push(value);
        }
        if data.is_empty() {
            return Err(PhaseError::InvalidValue {
                key: source,
                message: "no values to vote on".to_string(),
            });
        }
        ctx.cache_mut().set_as("data", &data)?;
        ctx.cache_mut().set_as("data_index", &0usize)?;
        Ok(())
    }

    fn compute(&mut self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        let data: Vec<f64> = ctx.cache().get_as("data")?.unwrap_or_default();
        let index: usize = ctx.cache().get_as("data_index")?.unwrap_or_default();
        let value = data
            .get(index)
            .copied()
            .ok_or_else(|| PhaseError::failed(format!("vote {index} requested after the last value")))?;

        let next = index + 1;
        ctx.cache_mut().set_as("data_index", &next)?;
        Ok(PhaseOutput::new()
            .with("vote", value % 2.0 == 0.0)
            .with_jump_to_next(next >= data.len()))
    }
}

struct SaveVoteResult;

impl ComputationPhase for SaveVoteResult {
    fn compute(&mut self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        let result: Value = ctx.input_field("vote_result")?;
        fs::write(ctx.out_dir().join("vote_results.json"), serde_json::to_vec(&result)?)?;
        Ok(PhaseOutput::new())
    }
}

struct CollectVote;

impl ComputationPhase for CollectVote {
    fn initialize(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), PhaseError> {
        ctx.cache_mut().set_as("vote_ballot", &Vec::<[u64; 2]>::new())?;
        Ok(())
    }

    fn compute(&mut self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        let mut positives = 0u64;
        for (site, output) in ctx.input() {
            match output.get("vote") {
                Some(Value::Bool(true)) => positives += 1,
                Some(Value::Bool(false)) => {}
                _ => return Err(PhaseError::MissingInput(format!("{site}.vote"))),
            }
        }
        let negatives = ctx.input().len() as u64 - positives;

        let mut ballot: Vec<[u64; 2]> = ctx.cache().get_as("vote_ballot")?.unwrap_or_default();
        ballot.push([positives, negatives]);
        ctx.cache_mut().set_as("vote_ballot", &ballot)?;
        Ok(PhaseOutput::new())
    }
}

struct SendGlobalResults;

impl ComputationPhase for SendGlobalResults {
    fn compute(&mut self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        let ballot: Vec<[u64; 2]> = ctx.cache().get_as("vote_ballot")?.unwrap_or_default();
        let (positive, negative) = ballot
            .iter()
            .fold((0, 0), |(p, n), [bp, bn]| (p + bp, n + bn));
        Ok(PhaseOutput::new().with(
            "vote_result",
            serde_json::json!({"positive_votes": positive, "negative_votes": negative}),
        ))
    }
}

// ---------------------------------------------------------------------------
// average
// ---------------------------------------------------------------------------

type Matrix = Vec<Vec<f64>>;

struct SendMatrix;

impl ComputationPhase for SendMatrix {
    fn compute(&mut self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        let matrix: Matrix = ctx.input_field("matrix")?;
        Ok(transfer::send(ctx, "site_matrix", &matrix)?)
    }
}

struct SaveAverage;

impl ComputationPhase for SaveAverage {
    fn compute(&mut self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        let averaged: Matrix = transfer::recv(ctx, "averaged_matrix")?;
        fs::write(ctx.out_dir().join("averaged_matrix.json"), serde_json::to_vec(&averaged)?)?;
        Ok(PhaseOutput::new())
    }
}

struct AggregateMatrix;

impl ComputationPhase for AggregateMatrix {
    fn compute(&mut self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        let matrices: Vec<(_, Matrix)> = transfer::recv_from_sites(ctx, "site_matrix")?;
        let mean = element_wise_mean(matrices.iter().map(|(_, m)| m))?;
        Ok(transfer::send(ctx, "averaged_matrix", &mean)?)
    }
}

fn element_wise_mean<'m>(mut matrices: impl Iterator<Item = &'m Matrix>) -> Result<Matrix, PhaseError> {
    let first = matrices
        .next()
        .ok_or_else(|| PhaseError::MissingInput("site_matrix".to_string()))?;
    let mut sum = first.clone();
    let mut count = 1.0;

    for matrix in matrices {
        let same_shape = matrix.len() == sum.len()
            && matrix.iter().zip(&sum).all(|(row, acc)| row.len() == acc.len());
        if !same_shape {
            return Err(PhaseError::InvalidValue {
                key: "site_matrix".to_string(),
                message: "sites sent matrices of different shapes".to_string(),
            });
        }
        for (acc, row) in sum.iter_mut().zip(matrix) {
            for (a, v) in acc.iter_mut().zip(row) {
                *a += v;
            }
        }
        count += 1.0;
    }

    for row in &mut sum {
        for value in row.iter_mut() {
            *value /= count;
        }
    }
    Ok(sum)
}
