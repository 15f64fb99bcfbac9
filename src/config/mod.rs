//! Configuration Module
//!
//! Loading of the run configuration and the sample table.
//!
//! - [`settings`]: YAML run configuration and required-key validation
//! - [`samples`]: sample table parsing and run-shape classification

pub mod samples;
pub mod settings;

pub use samples::{classify_run_shape, ReadPair, ReadSide, RunShape, Sample, SampleTable};
pub use settings::RunConfig;
