//! Rule Selection Policy
//!
//! Run-global decisions taken once per plan:
//! - which of the two mutually exclusive raw-input templates produces the
//!   per-sample raw read artifact, from the run shape of the sample table;
//! - which optional modules join the plan, from the feature flags. An
//!   enabled mutation-analysis module must have its reference on disk.
//!
//! The resulting [`PlanPolicy`] is stored in the plan and never
//! re-evaluated per node.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{RunConfig, RunShape, SampleTable};
use crate::error::PlanningError;

use super::template::Feature;

/// Strategy used to materialize each sample's raw reads.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawInputPolicy {
    /// Alias the single raw file (single mode)
    DirectLink,
    /// Merge every lane and sort records by read identifier (pooled mode)
    PoolAndSort,
}

/// Pure mapping from run shape to raw-input strategy.
pub fn select_raw_input(shape: RunShape) -> RawInputPolicy {
    match shape {
        RunShape::Single => RawInputPolicy::DirectLink,
        RunShape::Pooled => RawInputPolicy::PoolAndSort,
    }
}

/// Plan-time decisions shared by every node of a run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanPolicy {
    pub raw_input: RawInputPolicy,
    pub variant_calling: bool,
    pub mutation_analysis: bool,
}

impl PlanPolicy {
    /// Evaluates the policy for a run.
    ///
    /// Fails with [`PlanningError::MissingModuleReference`] when mutation
    /// analysis is enabled without an existing reference file.
    pub fn decide(config: &RunConfig, samples: &SampleTable) -> Result<Self, PlanningError> {
        let raw_input = select_raw_input(samples.shape());
        info!(
            "Raw input policy: {:?} ({:?} run with {} samples)",
            raw_input,
            samples.shape(),
            samples.len()
        );

        if config.run_breseq {
            check_mutation_reference(config)?;
        }

        if !config.run_freebayes {
            info!("Variant calling disabled; FreeBayes stages excluded");
        }

        Ok(Self {
            raw_input,
            variant_calling: config.run_freebayes,
            mutation_analysis: config.run_breseq,
        })
    }

    pub fn is_enabled(&self, feature: Feature) -> bool {
        match feature {
            Feature::VariantCalling => self.variant_calling,
            Feature::MutationAnalysis => self.mutation_analysis,
        }
    }
}

fn check_mutation_reference(config: &RunConfig) -> Result<(), PlanningError> {
    let module = "Mutation analysis (breseq)".to_string();

    let Some(reference) = config.breseq_reference.as_ref() else {
        return Err(PlanningError::MissingModuleReference {
            module,
            reason: "is not configured (set 'breseq_reference')".into(),
        });
    };

    if !reference.is_file() {
        warn!("breseq reference not found: {}", reference.display());
        return Err(PlanningError::MissingModuleReference {
            module,
            reason: format!("'{}' does not exist", reference.display()),
        });
    }

    Ok(())
}
