//! Barnes-Hut force simulation for graph layout
//!
//! Each iteration builds a fresh [`Octree`] over the current positions, evaluates
//! repulsion through it, adds spring forces along edges and a gravity pull
//! toward the origin, then integrates with damping. Pinned axes are clamped
//! after integration.
//!
//! A run has converged once no node moved further than the convergence epsilon
//! in the last iteration and, at the positions it left behind, no node's
//! residual force would move it further than that either. The residual of a node is its net force divided by its
//! local stiffness (attached spring constants plus gravity), which estimates
//! its remaining distance to equilibrium. Small displacement alone is not
//! enough: a damped spring is momentarily still at every turning point.

use std::collections::HashMap;
use std::ops::ControlFlow;

use glam::Vec3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{LayoutError, Result};
use crate::graph_types::{Edge, Node, NodeId, NodePosition, Pin};
use crate::spatial::{Octree, Repulsion, separation_direction};
use crate::visibility::VisibilityResult;

/// Default repulsion strength (Coulomb constant)
pub const DEFAULT_REPULSION: f32 = 30.0;

/// Default spring rest length
pub const DEFAULT_LINK_DISTANCE: f32 = 30.0;

/// Default spring constant
pub const DEFAULT_LINK_STRENGTH: f32 = 0.1;

/// Default pull toward the origin
pub const DEFAULT_GRAVITY: f32 = 0.01;

/// Default fraction of velocity removed each iteration
pub const DEFAULT_DAMPING: f32 = 0.4;

/// Default Barnes-Hut theta
pub const DEFAULT_THETA: f32 = 0.5;

/// Default iteration cap per run (D3.js cools over 300 ticks)
pub const DEFAULT_ITERATION_CAP: usize = 300;

/// Default convergence threshold on per-node displacement
pub const DEFAULT_CONVERGENCE_EPSILON: f32 = 0.01;

/// Default minimum separation used in force evaluation
pub const DEFAULT_MIN_DISTANCE: f32 = 1.0;

/// Default speed limit per iteration
pub const DEFAULT_MAX_VELOCITY: f32 = 100.0;

/// Smallest mass a node is simulated with
const MIN_MASS: f32 = 1e-3;

/// Below this node count repulsion is evaluated on the calling thread
const PARALLEL_THRESHOLD: usize = 256;

/// Configuration for the force simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationParameters {
    /// Repulsion strength between every pair of nodes
    pub repulsion_strength: f32,
    /// Spring rest length for edges without their own
    pub link_distance: f32,
    /// Spring constant
    pub link_strength: f32,
    /// Pull toward the origin
    pub gravity: f32,
    /// Fraction of velocity removed each iteration, in [0, 1)
    pub damping: f32,
    /// Barnes-Hut approximation threshold (0 = exact)
    pub theta: f32,
    /// Maximum iterations per run
    pub iteration_cap: usize,
    /// Run stops once no node moves, or is still pulled, further than this
    pub convergence_epsilon: f32,
    /// Separations are clamped to at least this distance
    pub min_distance: f32,
    /// Speed limit per iteration
    pub max_velocity: f32,
    /// 2 keeps every node on the z = 0 plane, 3 lays out in space
    pub dimensions: u8,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            repulsion_strength: DEFAULT_REPULSION,
            link_distance: DEFAULT_LINK_DISTANCE,
            link_strength: DEFAULT_LINK_STRENGTH,
            gravity: DEFAULT_GRAVITY,
            damping: DEFAULT_DAMPING,
            theta: DEFAULT_THETA,
            iteration_cap: DEFAULT_ITERATION_CAP,
            convergence_epsilon: DEFAULT_CONVERGENCE_EPSILON,
            min_distance: DEFAULT_MIN_DISTANCE,
            max_velocity: DEFAULT_MAX_VELOCITY,
            dimensions: 3,
        }
    }
}

impl SimulationParameters {
    /// Check every parameter is finite and in range
    pub fn validate(&self) -> Result<()> {
        let non_negative = [
            ("repulsion_strength", self.repulsion_strength),
            ("link_distance", self.link_distance),
            ("link_strength", self.link_strength),
            ("gravity", self.gravity),
            ("theta", self.theta),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(LayoutError::InvalidParameter(format!(
                    "{name} must be a finite non-negative number, got {value}"
                )));
            }
        }
        let positive = [
            ("convergence_epsilon", self.convergence_epsilon),
            ("min_distance", self.min_distance),
            ("max_velocity", self.max_velocity),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(LayoutError::InvalidParameter(format!(
                    "{name} must be a finite positive number, got {value}"
                )));
            }
        }
        if !(0.0..1.0).contains(&self.damping) {
            return Err(LayoutError::InvalidParameter(format!(
                "damping must be in [0, 1), got {}",
                self.damping
            )));
        }
        if self.iteration_cap == 0 {
            return Err(LayoutError::InvalidParameter(
                "iteration_cap must be at least 1".to_string(),
            ));
        }
        if !matches!(self.dimensions, 2 | 3) {
            return Err(LayoutError::InvalidParameter(format!(
                "dimensions must be 2 or 3, got {}",
                self.dimensions
            )));
        }
        Ok(())
    }
}

/// A node with position and velocity for simulation
#[derive(Debug, Clone)]
pub struct SimNode {
    pub id: NodeId,
    pub position: Vec3,
    pub velocity: Vec3,
    pub mass: f32,
    pub pin: Pin,
}

impl SimNode {
    fn from_node(node: &Node) -> Self {
        let position = if node.position().is_finite() {
            node.position()
        } else {
            Vec3::ZERO
        };
        let velocity = if node.velocity().is_finite() {
            node.velocity()
        } else {
            Vec3::ZERO
        };
        let pin = node.pin.finite_axes();
        if pin != node.pin {
            warn!(node = %node.id, "ignoring non-finite pin coordinate");
        }
        let mut sim = Self {
            id: node.id.clone(),
            position,
            velocity,
            mass: node.mass.max(MIN_MASS),
            pin,
        };
        sim.pin.apply(&mut sim.position, &mut sim.velocity);
        sim
    }
}

/// A spring between two nodes (indices into the node array)
#[derive(Debug, Clone)]
pub struct SimEdge {
    pub source: usize,
    pub target: usize,
    pub rest_length: f32,
    pub strength: f32,
}

/// Outcome of one iteration
#[derive(Debug, Clone, PartialEq)]
pub struct IterationResult {
    /// 1-based step counter, monotonically increasing over the simulator's lifetime
    pub step: u64,
    /// Largest distance any node moved
    pub max_displacement: f32,
    /// Largest estimated distance from equilibrium, from the forces of this step
    pub max_residual: f32,
    /// Nodes reset after producing non-finite values
    pub recovered: Vec<NodeId>,
}

/// Outcome of a [`ForceSimulator::run`]
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub iterations: usize,
    pub converged: bool,
    pub max_displacement: f32,
    pub recovered: usize,
}

/// Barnes-Hut force-directed layout
pub struct ForceSimulator {
    nodes: Vec<SimNode>,
    edges: Vec<SimEdge>,
    params: SimulationParameters,
    node_id_to_index: HashMap<NodeId, usize>,
    /// Local stiffness per node, the divisor of its residual force
    stiffness: Vec<f32>,
    /// Forces at the current positions, computed at the end of the last tick
    pending_forces: Option<Vec<Vec3>>,
    step: u64,
    converged: bool,
}

impl ForceSimulator {
    /// Create a simulation; edges with unknown endpoints or equal endpoints are dropped
    pub fn new(nodes: &[Node], edges: &[Edge], params: SimulationParameters) -> Self {
        let mut sim_nodes: Vec<SimNode> = nodes.iter().map(SimNode::from_node).collect();

        if sim_nodes.len() > 1 && sim_nodes.iter().all(|n| n.position == Vec3::ZERO) {
            seed_positions(&mut sim_nodes, &params);
        }
        if params.dimensions == 2 {
            for node in &mut sim_nodes {
                node.velocity.z = 0.0;
            }
        }

        let node_id_to_index: HashMap<NodeId, usize> = sim_nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let sim_edges: Vec<SimEdge> = edges
            .iter()
            .filter_map(|e| {
                let source = *node_id_to_index.get(&e.source)?;
                let target = *node_id_to_index.get(&e.target)?;
                if source == target {
                    return None;
                }
                Some(SimEdge {
                    source,
                    target,
                    rest_length: e.rest_length.unwrap_or(params.link_distance),
                    strength: params.link_strength * e.weight.unwrap_or(1.0),
                })
            })
            .collect();

        let mut stiffness: Vec<f32> = sim_nodes
            .iter()
            .map(|node| params.gravity * node.mass)
            .collect();
        for edge in &sim_edges {
            stiffness[edge.source] += edge.strength;
            stiffness[edge.target] += edge.strength;
        }

        debug!(
            nodes = sim_nodes.len(),
            edges = sim_edges.len(),
            dropped_edges = edges.len() - sim_edges.len(),
            "created force simulation"
        );

        Self {
            nodes: sim_nodes,
            edges: sim_edges,
            params,
            node_id_to_index,
            stiffness,
            pending_forces: None,
            step: 0,
            converged: false,
        }
    }

    /// Create a simulation over a visibility projection
    pub fn from_visibility(visible: &VisibilityResult, params: SimulationParameters) -> Self {
        Self::new(&visible.visible_nodes, &visible.visible_edges, params)
    }

    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[SimEdge] {
        &self.edges
    }

    pub fn parameters(&self) -> &SimulationParameters {
        &self.params
    }

    /// Steps taken so far
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Whether the last iteration left every node within the convergence epsilon of rest
    pub fn is_converged(&self) -> bool {
        self.converged
    }

    /// Change the approximation factor; takes effect from the next iteration
    pub fn set_theta(&mut self, theta: f32) {
        if theta.is_finite() {
            self.params.theta = theta.max(0.0);
            self.pending_forces = None;
        }
    }

    /// Pin a node; pinned axes jump to their coordinates immediately
    ///
    /// Non-finite pin coordinates are rejected with [`LayoutError::InvalidParameter`].
    pub fn pin(&mut self, id: &str, pin: Pin) -> Result<()> {
        let idx = self.index_of(id)?;
        if pin.finite_axes() != pin {
            return Err(LayoutError::InvalidParameter(format!(
                "pin for {id} has a non-finite coordinate"
            )));
        }
        let node = &mut self.nodes[idx];
        node.pin = pin;
        node.pin.apply(&mut node.position, &mut node.velocity);
        self.pending_forces = None;
        self.converged = false;
        Ok(())
    }

    pub fn unpin(&mut self, id: &str) -> Result<()> {
        let idx = self.index_of(id)?;
        self.nodes[idx].pin = Pin::default();
        self.converged = false;
        Ok(())
    }

    pub fn position_of(&self, id: &str) -> Result<Vec3> {
        Ok(self.nodes[self.index_of(id)?].position)
    }

    fn index_of(&self, id: &str) -> Result<usize> {
        self.node_id_to_index
            .get(id)
            .copied()
            .ok_or_else(|| LayoutError::InvalidGraphReference(id.to_string()))
    }

    /// Snapshot of every node's position
    pub fn positions(&self) -> Vec<NodePosition> {
        self.nodes
            .iter()
            .map(|n| NodePosition::new(n.id.clone(), n.position))
            .collect()
    }

    /// Copy positions and velocities back onto matching caller nodes
    pub fn write_back(&self, nodes: &mut [Node]) {
        for node in nodes {
            if let Some(&idx) = self.node_id_to_index.get(&node.id) {
                let sim = &self.nodes[idx];
                (node.x, node.y, node.z) = sim.position.into();
                (node.vx, node.vy, node.vz) = sim.velocity.into();
            }
        }
    }

    /// Run one iteration
    pub fn tick(&mut self) -> IterationResult {
        self.step += 1;
        let n = self.nodes.len();
        if n == 0 {
            self.converged = true;
            return IterationResult {
                step: self.step,
                max_displacement: 0.0,
                max_residual: 0.0,
                recovered: Vec::new(),
            };
        }

        let forces = self
            .pending_forces
            .take()
            .unwrap_or_else(|| self.net_forces());
        let mut result = self.integrate(&forces);

        let next = self.net_forces();
        result.max_residual = self.max_residual(&next);
        self.pending_forces = Some(next);

        let epsilon = self.params.convergence_epsilon;
        self.converged = result.recovered.is_empty()
            && result.max_displacement < epsilon
            && result.max_residual < epsilon;
        result
    }

    fn net_forces(&self) -> Vec<Vec3> {
        let mut forces = self.repulsion_forces();
        self.apply_link_force(&mut forces);
        self.apply_center_force(&mut forces);
        forces
    }

    /// Largest remaining distance to equilibrium over the free axes of every node
    fn max_residual(&self, forces: &[Vec3]) -> f32 {
        let flat = self.params.dimensions == 2;
        self.nodes
            .iter()
            .zip(forces)
            .zip(&self.stiffness)
            .map(|((node, force), &stiffness)| {
                let mut force = node.pin.free_axes(*force);
                if flat {
                    force.z = 0.0;
                }
                let divisor = if stiffness > 0.0 { stiffness } else { node.mass };
                let residual = force.length() / divisor;
                if residual.is_finite() { residual } else { f32::INFINITY }
            })
            .fold(0.0, f32::max)
    }

    /// Repulsion on every node through a tree owned by this call
    fn repulsion_forces(&self) -> Vec<Vec3> {
        let n = self.nodes.len();
        let strength = self.params.repulsion_strength;
        if strength == 0.0 {
            return vec![Vec3::ZERO; n];
        }

        let tree = Octree::build(self.nodes.iter().map(|node| (node.position, node.mass)));
        let theta = self.params.theta;
        let min_distance = self.params.min_distance;

        let evaluated: Vec<Repulsion> = if n >= PARALLEL_THRESHOLD {
            (0..n)
                .into_par_iter()
                .map(|i| tree.evaluate(i, theta, strength, min_distance))
                .collect()
        } else {
            (0..n)
                .map(|i| tree.evaluate(i, theta, strength, min_distance))
                .collect()
        };
        trace!(
            step = self.step,
            theta,
            interactions = evaluated.iter().map(|r| r.interactions).sum::<usize>(),
            "repulsion evaluated"
        );
        evaluated.into_iter().map(|r| r.force).collect()
    }

    /// Hooke's law along each edge toward its rest length
    fn apply_link_force(&self, forces: &mut [Vec3]) {
        for edge in &self.edges {
            let delta = self.nodes[edge.target].position - self.nodes[edge.source].position;
            let distance = delta.length();
            let direction = if distance > f32::EPSILON {
                delta / distance
            } else {
                separation_direction(edge.source, edge.target)
            };
            let stretch = distance - edge.rest_length;
            let force = direction * (stretch * edge.strength);

            forces[edge.source] += force;
            forces[edge.target] -= force;
        }
    }

    /// Pull toward the origin, independent of mass
    fn apply_center_force(&self, forces: &mut [Vec3]) {
        let gravity = self.params.gravity;
        if gravity == 0.0 {
            return;
        }
        for (force, node) in forces.iter_mut().zip(&self.nodes) {
            *force -= node.position * gravity * node.mass;
        }
    }

    fn integrate(&mut self, forces: &[Vec3]) -> IterationResult {
        let keep = 1.0 - self.params.damping;
        let max_velocity = self.params.max_velocity;
        let flat = self.params.dimensions == 2;
        let mut max_displacement: f32 = 0.0;
        let mut recovered = Vec::new();

        for (node, force) in self.nodes.iter_mut().zip(forces) {
            let mut velocity = (node.velocity + *force / node.mass) * keep;
            if flat {
                velocity.z = 0.0;
            }
            let speed = velocity.length();
            if speed > max_velocity {
                velocity *= max_velocity / speed;
            }
            let mut position = node.position + velocity;
            node.pin.apply(&mut position, &mut velocity);

            if !position.is_finite() || !velocity.is_finite() {
                warn!(
                    node = %node.id,
                    step = self.step,
                    "non-finite position or velocity, resetting node"
                );
                node.velocity = Vec3::ZERO;
                recovered.push(node.id.clone());
                continue;
            }

            max_displacement = max_displacement.max((position - node.position).length());
            node.position = position;
            node.velocity = velocity;
        }

        IterationResult {
            step: self.step,
            max_displacement,
            max_residual: 0.0,
            recovered,
        }
    }

    /// Run until convergence or the iteration cap
    pub fn run(&mut self) -> RunSummary {
        self.run_with(|_, _| ControlFlow::Continue(()))
    }

    /// Run like [`run`](Self::run), calling `on_iteration` after every step
    ///
    /// Returning `ControlFlow::Break` stops the run early.
    pub fn run_with<F>(&mut self, mut on_iteration: F) -> RunSummary
    where
        F: FnMut(&IterationResult, &ForceSimulator) -> ControlFlow<()>,
    {
        let mut summary = RunSummary {
            iterations: 0,
            converged: false,
            max_displacement: 0.0,
            recovered: 0,
        };

        while summary.iterations < self.params.iteration_cap {
            let result = self.tick();
            summary.iterations += 1;
            summary.max_displacement = result.max_displacement;
            summary.recovered += result.recovered.len();
            summary.converged = self.converged;

            if on_iteration(&result, self).is_break() || self.converged {
                break;
            }
        }

        debug!(
            iterations = summary.iterations,
            converged = summary.converged,
            max_displacement = summary.max_displacement,
            "simulation run finished"
        );
        summary
    }
}

/// Spread nodes that all start at the origin on a Fibonacci sphere (circle in 2D)
fn seed_positions(nodes: &mut [SimNode], params: &SimulationParameters) {
    let n = nodes.len() as f32;
    let radius = params.link_distance.max(1.0) * n.cbrt();
    let golden_ratio = (1.0 + 5.0_f32.sqrt()) / 2.0;

    for (index, node) in nodes.iter_mut().enumerate() {
        if !node.pin.is_free() {
            continue;
        }
        let i = index as f32;
        node.position = if params.dimensions == 2 {
            let angle = 2.0 * std::f32::consts::PI * i / n;
            Vec3::new(radius * angle.cos(), radius * angle.sin(), 0.0)
        } else {
            let theta = 2.0 * std::f32::consts::PI * i / golden_ratio;
            let phi = (1.0 - 2.0 * (i + 0.5) / n).acos();
            Vec3::new(
                radius * phi.sin() * theta.cos(),
                radius * phi.sin() * theta.sin(),
                radius * phi.cos(),
            )
        };
    }
}
