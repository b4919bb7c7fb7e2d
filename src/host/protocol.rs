//! Messages exchanged across the execution boundary
//!
//! Both execution strategies speak the same protocol. Requests and events are
//! plain owned values (copy-on-send); nothing is shared between the caller and
//! the unit running the simulation. The JSON shape is
//! `{"id": 1, "type": "initialize", ...}` for requests and
//! `{"request": 1, "type": "positions", ...}` for events.

use serde::{Deserialize, Serialize};

use crate::graph_types::{Edge, Node, NodeId, NodePosition};
use crate::simulation::SimulationParameters;

/// Correlates events with the request that caused them
pub type RequestId = u64;

/// Caller to execution unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HostRequest {
    #[serde(rename_all = "camelCase")]
    Initialize {
        node_count: usize,
        parameters: SimulationParameters,
    },
    /// Lay out the given (already projected) graph
    Compute {
        nodes: Vec<Node>,
        edges: Vec<Edge>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        theta: Option<f32>,
    },
    Dispose,
}

impl HostRequest {
    pub fn name(&self) -> &'static str {
        match self {
            HostRequest::Initialize { .. } => "initialize",
            HostRequest::Compute { .. } => "compute",
            HostRequest::Dispose => "dispose",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: RequestId,
    #[serde(flatten)]
    pub request: HostRequest,
}

/// Execution unit to caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HostEvent {
    Initialized,
    Positions {
        /// Simulation step the snapshot was taken at
        step: u64,
        positions: Vec<NodePosition>,
        /// Nodes reset after numeric instability since the previous batch
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        unstable: Vec<NodeId>,
        /// Last batch of the compute request
        done: bool,
    },
    Error {
        error: String,
    },
    Disposed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub request: RequestId,
    #[serde(flatten)]
    pub event: HostEvent,
}

impl EventEnvelope {
    pub fn new(request: RequestId, event: HostEvent) -> Self {
        Self { request, event }
    }
}
