//! ampliflow - Amplicon Sequencing Workflow Orchestrator
//!
//! Plans and runs the per-sample processing chain of a SARS-CoV-2 amplicon
//! sequencing batch (read QC, host removal, trimming, taxonomic screening,
//! mapping, variant calling, lineage assignment), isolates failures to the
//! affected samples and writes a fault-tolerant batch summary.
//!
//! # Architecture
//!
//! - [`config`]: run configuration and sample table loading
//! - [`workflow`]: stage templates, rule selection and the plan graph
//! - [`execution`]: parallel scheduling and node invocation
//! - [`monitoring`]: resource usage tracking and execution timeline
//! - [`postprocess`]: batch summary, version manifest and ncov-tools staging
//!
//! # Example
//!
//! ```rust,no_run
//! use ampliflow::config::{RunConfig, SampleTable};
//! use ampliflow::execution::Engine;
//! use ampliflow::postprocess::Aggregator;
//! use ampliflow::workflow::{PlanPolicy, RuleGraphBuilder, StageRegistry};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RunConfig::load("config.yaml")?;
//!     let samples = SampleTable::load(&config.samples)?;
//!
//!     let policy = PlanPolicy::decide(&config, &samples)?;
//!     let registry = StageRegistry::standard(&config);
//!     let plan = RuleGraphBuilder::new(&registry, &samples, policy).build_default()?;
//!
//!     let mut engine = Engine::new(&plan, &config.result_dir);
//!     engine.set_keep_going(true);
//!     let report = engine.run()?;
//!
//!     Aggregator::new(&config, &samples).run()?;
//!     std::process::exit(if report.is_success() { 0 } else { 1 });
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod postprocess;
pub mod workflow;

pub use config::{RunConfig, SampleTable};
pub use error::{Error, Result};
pub use execution::Engine;
pub use workflow::{Plan, RuleGraphBuilder, StageRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "ampliflow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "ampliflow");
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }

    #[test]
    fn test_module_exports_registry() {
        let registry = StageRegistry::new();
        assert!(registry.templates().is_empty());
    }
}
