//! Graph data types shared by visibility, simulation and host
//!
//! Nodes and edges are owned by the caller and handed to each computation by
//! reference or by value. The serialized shape is the one the external renderer
//! exchanges (`{id, x, y, z, fx?, fy?, fz?}` for nodes).

use std::path::Path;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::config;
use crate::error::Result;

/// Stable node identifier
pub type NodeId = String;

/// Stable edge identifier
pub type EdgeId = String;

fn default_mass() -> f32 {
    1.0
}

fn is_default_mass(mass: &f32) -> bool {
    *mass == 1.0
}

/// Per-axis pin; a pinned axis ignores computed forces
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fx: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fy: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fz: Option<f32>,
}

impl Pin {
    /// Pin all three axes
    pub fn at(x: f32, y: f32, z: f32) -> Self {
        Self {
            fx: Some(x),
            fy: Some(y),
            fz: Some(z),
        }
    }

    /// True when no axis is pinned
    pub fn is_free(&self) -> bool {
        self.fx.is_none() && self.fy.is_none() && self.fz.is_none()
    }

    /// The same pin with every non-finite coordinate released
    pub fn finite_axes(&self) -> Self {
        Self {
            fx: self.fx.filter(|v| v.is_finite()),
            fy: self.fy.filter(|v| v.is_finite()),
            fz: self.fz.filter(|v| v.is_finite()),
        }
    }

    /// `v` with its pinned axes zeroed
    pub fn free_axes(&self, mut v: Vec3) -> Vec3 {
        if self.fx.is_some() {
            v.x = 0.0;
        }
        if self.fy.is_some() {
            v.y = 0.0;
        }
        if self.fz.is_some() {
            v.z = 0.0;
        }
        v
    }

    /// Overwrite pinned axes of `position`, zeroing the matching `velocity` axes
    pub fn apply(&self, position: &mut Vec3, velocity: &mut Vec3) {
        if let Some(fx) = self.fx {
            position.x = fx;
            velocity.x = 0.0;
        }
        if let Some(fy) = self.fy {
            position.y = fy;
            velocity.y = 0.0;
        }
        if let Some(fz) = self.fz {
            position.z = fz;
            velocity.z = 0.0;
        }
    }
}

/// A node in the full graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for the node
    pub id: NodeId,

    /// Position in 3D space (2D graphs keep z = 0)
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
    #[serde(default)]
    pub z: f32,

    /// Velocity carried over from a previous layout run
    #[serde(default)]
    pub vx: f32,
    #[serde(default)]
    pub vy: f32,
    #[serde(default)]
    pub vz: f32,

    /// Weight used for repulsion and inertia
    #[serde(default = "default_mass", skip_serializing_if = "is_default_mass")]
    pub mass: f32,

    /// Optional fixed coordinates overriding the simulation
    #[serde(flatten)]
    pub pin: Pin,

    /// Optional hierarchy parent, in addition to hierarchy edges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<NodeId>,
}

impl Node {
    /// Create a free node at the origin
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            x: 0.0,
            y: 0.0,
            z: 0.0,
            vx: 0.0,
            vy: 0.0,
            vz: 0.0,
            mass: 1.0,
            pin: Pin::default(),
            parent: None,
        }
    }

    /// Set the position
    pub fn at(mut self, x: f32, y: f32, z: f32) -> Self {
        self.x = x;
        self.y = y;
        self.z = z;
        self
    }

    /// Set the mass
    pub fn with_mass(mut self, mass: f32) -> Self {
        self.mass = mass;
        self
    }

    /// Pin the node at the given coordinates
    pub fn pinned(mut self, fx: f32, fy: f32, fz: f32) -> Self {
        self.pin = Pin::at(fx, fy, fz);
        self
    }

    /// Set the hierarchy parent
    pub fn with_parent(mut self, parent: impl Into<NodeId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn position(&self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }

    pub fn velocity(&self) -> Vec3 {
        Vec3::new(self.vx, self.vy, self.vz)
    }
}

/// Role of an edge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Parent (source) to child (target); defines the collapse hierarchy
    #[default]
    Hierarchy,
    /// Plain relationship; takes part in the layout but not in the hierarchy
    Link,
}

/// An edge connecting two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,

    /// Source node ID (the parent for hierarchy edges)
    pub source: NodeId,

    /// Target node ID (the child for hierarchy edges)
    pub target: NodeId,

    #[serde(default)]
    pub kind: EdgeKind,

    /// Spring rest length; falls back to the simulation's link distance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest_length: Option<f32>,

    /// Spring strength multiplier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f32>,
}

impl Edge {
    /// Create a hierarchy edge from `source` (parent) to `target` (child)
    pub fn new(
        id: impl Into<EdgeId>,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            kind: EdgeKind::Hierarchy,
            rest_length: None,
            weight: None,
        }
    }

    /// Create a non-hierarchical edge
    pub fn link(
        id: impl Into<EdgeId>,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
    ) -> Self {
        Self {
            kind: EdgeKind::Link,
            ..Self::new(id, source, target)
        }
    }

    /// Set the rest length (target distance)
    pub fn with_rest_length(mut self, rest_length: f32) -> Self {
        self.rest_length = Some(rest_length);
        self
    }

    /// Set the spring weight
    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn is_hierarchy(&self) -> bool {
        self.kind == EdgeKind::Hierarchy
    }
}

/// Position of one node, as streamed to the renderer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    pub id: NodeId,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl NodePosition {
    pub fn new(id: impl Into<NodeId>, position: Vec3) -> Self {
        Self {
            id: id.into(),
            x: position.x,
            y: position.y,
            z: position.z,
        }
    }

    pub fn to_vec3(&self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }
}

/// A graph plus its collapse state, as read by the CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDocument {
    pub nodes: Vec<Node>,

    #[serde(default)]
    pub edges: Vec<Edge>,

    /// Ids collapsed when the document was saved
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collapsed: Vec<NodeId>,
}

impl GraphDocument {
    /// Read a document from a `.json`, `.yaml` or `.yml` file
    pub fn from_path(path: &Path) -> Result<Self> {
        config::read_file(path)
    }
}
