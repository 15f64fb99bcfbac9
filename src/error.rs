//! Error Taxonomy
//!
//! Fatal errors are split by the phase that raises them:
//!
//! - [`ConfigError`]: configuration or sample table problems, raised before
//!   anything is planned
//! - [`PlanningError`]: structural problems found while building the graph,
//!   raised before any node executes
//! - [`ExecutionError`]: faults of the engine itself (not of a node)
//! - [`PostprocessError`]: the report could not be written
//!
//! A failing node is never an `Err`; it is recorded as a
//! [`RunResult`](crate::execution::RunResult) and only affects its dependents.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Invalid or unreadable run configuration / sample table.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse configuration '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Configuration is missing required keys: {}", .0.join(", "))]
    MissingKeys(Vec<String>),

    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Sample table '{path}' is missing required column '{column}'")]
    MissingColumn { path: PathBuf, column: String },

    #[error("Sample table '{path}' line {line}: {reason}")]
    MalformedRow {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Sample table '{0}' contains no samples")]
    EmptySampleTable(PathBuf),
}

/// Structural problem detected while building the execution plan.
#[derive(Debug, Error, PartialEq)]
pub enum PlanningError {
    #[error("No enabled stage produces '{artifact}' (required by {required_by})")]
    UnresolvedInput {
        artifact: String,
        required_by: String,
    },

    #[error("Artifact '{artifact}' has more than one enabled producer: {}", .producers.join(", "))]
    AmbiguousProducer {
        artifact: String,
        producers: Vec<String>,
    },

    #[error("Cyclic dependency detected through {0}")]
    Cycle(String),

    #[error("Stage '{template}': pattern '{pattern}' uses unbound wildcard '{{{wildcard}}}'")]
    UnboundWildcard {
        template: String,
        pattern: String,
        wildcard: String,
    },

    #[error("Raw input '{path}' for sample '{sample}' does not exist")]
    MissingRawInput { sample: String, path: PathBuf },

    #[error("{module} is enabled but its reference {reason}")]
    MissingModuleReference { module: String, reason: String },

    #[error("Unknown target '{0}'")]
    UnknownTarget(String),
}

/// Failure of the execution engine itself.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Failed to persist run state to '{path}': {message}")]
    Ledger { path: PathBuf, message: String },

    #[error("Worker channel closed unexpectedly: {0}")]
    Channel(String),

    #[error("Working directory '{path}' is unusable: {source}")]
    WorkingDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failure to produce the postprocessing outputs themselves.
///
/// Missing upstream artifacts are never reported through this type.
#[derive(Debug, Error)]
pub enum PostprocessError {
    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize '{path}': {message}")]
    Serialize { path: PathBuf, message: String },

    #[error("'{0}' must be configured for this target")]
    NotConfigured(&'static str),
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Postprocess(#[from] PostprocessError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
