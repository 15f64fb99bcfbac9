//! Plan Execution Module
//!
//! Runs a resolved plan with bounded parallelism, failure isolation and
//! abort support.
//!
//! # Architecture
//!
//! - [`engine`]: main loop dispatching nodes to worker threads
//! - [`scheduler`]: node states, thread budget and failure propagation
//! - [`invoke`]: execution of one node (shell contract or built-in)
//! - [`builtin`]: in-process raw-input linking and lane pooling

pub mod builtin;
pub mod engine;
pub mod invoke;
pub mod scheduler;

pub use engine::{AbortHandle, Engine, RunReport};
pub use invoke::execute_node;
pub use scheduler::{NodeState, NotRunReason, RunResult, Scheduler};
