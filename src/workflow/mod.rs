//! Workflow Definition Module
//!
//! Stage templates, their resolution into a per-sample task graph, and the
//! run ledger.
//!
//! # Structure
//!
//! - [`pattern`]: Artifact path patterns and wildcard bindings
//! - [`template`]: Stage templates and command rendering
//! - [`layout`]: Output tree layout
//! - [`registry`]: The standard stage catalogue and default targets
//! - [`policy`]: Run-global rule selection
//! - [`graph`]: Backward resolution into an execution plan
//! - [`state`]: Persisted node results

pub mod graph;
pub mod layout;
pub mod pattern;
pub mod policy;
pub mod registry;
pub mod state;
pub mod template;

pub use graph::{Edge, Node, NodeId, Plan, ResolvedAction, RuleGraphBuilder};
pub use pattern::{ArtifactPattern, WildcardBinding};
pub use policy::{select_raw_input, PlanPolicy, RawInputPolicy};
pub use registry::StageRegistry;
pub use state::RunLedger;
pub use template::{Action, FailurePolicy, Feature, Guard, StageTemplate};
