//! Monitoring Module
//!
//! Step-level timing for workflow executions.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Step start/end timing for Gantt charts and overlap checks

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
