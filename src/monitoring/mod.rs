//! Monitoring Module
//!
//! - [`ResourceMonitor`]: CPU and memory sampling of a node's process tree,
//!   summarized into a [`BenchmarkRecord`]
//! - [`ExecutionTimeline`]: node start/end timing for the Gantt chart

pub mod resource;
pub mod timeline;

pub use resource::{BenchmarkRecord, ResourceMonitor, ResourceSample};
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
