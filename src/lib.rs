//! graph-layout-engine - adaptive layout and visibility for large node-link graphs.
//!
//! The engine has four parts that feed each other:
//!
//! - [`visibility`] reduces a graph to what is currently displayed, given a set of
//!   collapsed nodes, and computes which collapsed ancestors to open to reveal a node
//! - [`simulation`] lays out the visible subgraph with a Barnes-Hut force
//!   simulation built on the [`spatial`] octree
//! - [`host`] runs the simulation inline or on a background thread behind one
//!   message protocol and streams position batches back
//! - [`performance`] turns frame-rate samples into an approximation factor and
//!   render budgets

pub mod config;
pub mod error;
pub mod graph_types;
pub mod host;
pub mod observer;
pub mod performance;
pub mod simulation;
pub mod spatial;
pub mod telemetry;
pub mod visibility;

pub use config::{ExecutionMode, HostConfig, LayoutConfig};
pub use error::{LayoutError, Result};
pub use graph_types::{Edge, EdgeKind, GraphDocument, Node, NodeId, NodePosition, Pin};
pub use host::{HostState, PositionBatch, SimulationHost};
pub use observer::{LayoutObserver, NoopObserver, TracingObserver};
pub use performance::{
    ControllerConfig, PerformanceController, PerformanceMode, PerformanceSample,
    PerformanceSettings,
};
pub use simulation::{ForceSimulator, SimulationParameters};
pub use visibility::{
    CollapsedSet, VisibilityProjector, VisibilityResult, get_expand_path, get_visible_entities,
};
