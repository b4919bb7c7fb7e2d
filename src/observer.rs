//! Injectable observer for engine events
//!
//! Each controller or host instance holds its own `Arc<dyn LayoutObserver>`;
//! there is no global logger state. [`TracingObserver`] forwards everything to
//! `tracing`, [`NoopObserver`] drops it.

use tracing::{debug, info, warn};

use crate::host::HostState;
use crate::performance::PerformanceMode;

/// Receives notable events from the controller and the simulation host
///
/// Every method has an empty default, so implementors only override what they
/// care about. Callbacks run on the thread that produced the event and must
/// not block.
pub trait LayoutObserver: Send + Sync {
    /// The performance mode switched
    fn mode_changed(&self, _from: PerformanceMode, _to: PerformanceMode) {}

    /// The Barnes-Hut theta was retuned
    fn theta_adjusted(&self, _from: f32, _to: f32, _average_fps: f32) {}

    /// A node produced non-finite values and was reset
    fn numeric_instability(&self, _node: &str, _step: u64) {}

    /// A simulation host moved between lifecycle states
    fn host_state_changed(&self, _from: HostState, _to: HostState) {}

    /// A position batch was handed to the caller
    fn positions_delivered(&self, _step: u64, _count: usize) {}
}

/// Ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl LayoutObserver for NoopObserver {}

/// Logs every event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl LayoutObserver for TracingObserver {
    fn mode_changed(&self, from: PerformanceMode, to: PerformanceMode) {
        info!(from = %from, to = %to, "performance mode changed");
    }

    fn theta_adjusted(&self, from: f32, to: f32, average_fps: f32) {
        debug!(from, to, average_fps, "barnes-hut theta adjusted");
    }

    fn numeric_instability(&self, node: &str, step: u64) {
        warn!(node, step, "recovered node from numeric instability");
    }

    fn host_state_changed(&self, from: HostState, to: HostState) {
        info!(from = %from, to = %to, "simulation host state changed");
    }

    fn positions_delivered(&self, step: u64, count: usize) {
        debug!(step, count, "positions delivered");
    }
}
