//! Postprocessing Module
//!
//! Passes that run outside the plan, over whatever the run left on disk:
//!
//! - [`aggregate`]: per-sample batch summary (`summary.tsv`)
//! - [`manifest`]: tool and database version manifest (`versions.json`)
//! - [`metrics`]: extraction of individual metrics from stage artifacts
//! - [`ncov_tools`]: staging for the ncov-tools QC suite

pub mod aggregate;
pub mod manifest;
pub mod metrics;
pub mod ncov_tools;

pub use aggregate::{Aggregator, PostprocessReport, SampleSummary};
pub use manifest::VersionManifest;
pub use ncov_tools::{NcovToolsSetup, VariantSource};
