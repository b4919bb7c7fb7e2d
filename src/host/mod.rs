//! Simulation host: lifecycle and streaming around a [`LayoutWorker`]
//!
//! A [`SimulationHost`] owns one execution unit and walks it through
//! `uninitialized -> initializing -> running -> disposed`, with `failed` reachable
//! from `initializing` and `running`. The caller sees the same contract whether
//! the unit is inline or on a background thread:
//!
//! - `compute` is refused until `initialize` has been acknowledged
//! - an unacknowledged `initialize` fails the host after `init_timeout`
//! - position batches arrive in non-decreasing step order
//! - nothing is delivered once `dispose` has been called
//!
//! The handle is cheap to clone, so `dispose` can be called from another task
//! while `initialize` or `next_batch` is pending.
//!
//! A host can follow a [`PerformanceController`](crate::PerformanceController)
//! through [`SimulationHost::follow_settings`]: each `compute` without an
//! explicit theta takes the controller's current theta as a snapshot, which
//! then stays fixed for every iteration of that request.

pub mod protocol;
pub mod unit;
pub mod worker;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::error::{LayoutError, Result};
use crate::graph_types::{Edge, Node, NodeId, NodePosition};
use crate::observer::{LayoutObserver, TracingObserver};
use crate::performance::PerformanceSettings;
use crate::simulation::SimulationParameters;
use crate::visibility::VisibilityResult;

pub use protocol::{EventEnvelope, HostEvent, HostRequest, RequestEnvelope, RequestId};
pub use unit::{BackgroundUnit, ExecutionStrategy, ExecutionUnit, InlineUnit};
pub use worker::{EventSink, LayoutWorker};

/// Lifecycle state of a [`SimulationHost`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostState {
    Uninitialized,
    Initializing,
    Running,
    Disposed,
    Failed,
}

impl HostState {
    pub fn as_str(self) -> &'static str {
        match self {
            HostState::Uninitialized => "uninitialized",
            HostState::Initializing => "initializing",
            HostState::Running => "running",
            HostState::Disposed => "disposed",
            HostState::Failed => "failed",
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One streamed snapshot of node positions
#[derive(Debug, Clone, PartialEq)]
pub struct PositionBatch {
    /// The compute request this batch answers
    pub request: RequestId,
    pub step: u64,
    pub positions: Vec<NodePosition>,
    /// Nodes reset after numeric instability since the previous batch
    pub unstable: Vec<NodeId>,
    /// Last batch for `request`
    pub done: bool,
}

impl PositionBatch {
    /// Fail with [`LayoutError::NumericInstability`] if any node had to be recovered
    pub fn ensure_stable(&self) -> Result<()> {
        match self.unstable.first() {
            Some(node) => Err(LayoutError::NumericInstability {
                node: node.clone(),
                step: self.step,
            }),
            None => Ok(()),
        }
    }
}

struct Inner {
    init_timeout: Duration,
    strategy: Option<ExecutionStrategy>,
    state: watch::Sender<HostState>,
    unit: Mutex<Option<Box<dyn ExecutionUnit>>>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<EventEnvelope>>,
    next_request: AtomicU64,
    last_step: Mutex<Option<u64>>,
    last_positions: Mutex<Option<PositionBatch>>,
    /// Held while a batch is handed out and while disposing
    delivery: Mutex<()>,
    settings: Mutex<Option<watch::Receiver<PerformanceSettings>>>,
    observer: Arc<dyn LayoutObserver>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(mut unit) = self.unit.get_mut().take() {
            unit.shutdown();
        }
    }
}

/// Runs a force simulation behind the initialize/compute/dispose protocol
#[derive(Clone)]
pub struct SimulationHost {
    inner: Arc<Inner>,
}

impl fmt::Debug for SimulationHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationHost")
            .field("state", &self.state())
            .field("strategy", &self.inner.strategy)
            .finish()
    }
}

impl SimulationHost {
    /// Create a host with the execution strategy from `config`
    pub fn new(config: &HostConfig) -> Result<Self> {
        Self::with_observer(config, Arc::new(TracingObserver))
    }

    pub fn with_observer(config: &HostConfig, observer: Arc<dyn LayoutObserver>) -> Result<Self> {
        config.validate()?;
        let strategy = config.execution.resolve();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let unit: Box<dyn ExecutionUnit> = match strategy {
            ExecutionStrategy::Inline => Box::new(InlineUnit::new(config.batch_interval, events_tx)),
            ExecutionStrategy::Background => {
                Box::new(BackgroundUnit::spawn(config.batch_interval, events_tx)?)
            }
        };
        info!(strategy = ?strategy, "simulation host created");
        Ok(Self::build(config, Some(strategy), unit, events_rx, observer))
    }

    /// Create a host around a caller-supplied unit that reports on `events`
    pub fn with_unit(
        config: &HostConfig,
        unit: Box<dyn ExecutionUnit>,
        events: mpsc::UnboundedReceiver<EventEnvelope>,
        observer: Arc<dyn LayoutObserver>,
    ) -> Self {
        Self::build(config, None, unit, events, observer)
    }

    fn build(
        config: &HostConfig,
        strategy: Option<ExecutionStrategy>,
        unit: Box<dyn ExecutionUnit>,
        events: mpsc::UnboundedReceiver<EventEnvelope>,
        observer: Arc<dyn LayoutObserver>,
    ) -> Self {
        let (state, _) = watch::channel(HostState::Uninitialized);
        Self {
            inner: Arc::new(Inner {
                init_timeout: config.init_timeout(),
                strategy,
                state,
                unit: Mutex::new(Some(unit)),
                events: tokio::sync::Mutex::new(events),
                next_request: AtomicU64::new(1),
                last_step: Mutex::new(None),
                last_positions: Mutex::new(None),
                delivery: Mutex::new(()),
                settings: Mutex::new(None),
                observer,
            }),
        }
    }

    pub fn state(&self) -> HostState {
        *self.inner.state.borrow()
    }

    /// Strategy the host was built with; `None` for a caller-supplied unit
    pub fn strategy(&self) -> Option<ExecutionStrategy> {
        self.inner.strategy
    }

    /// Take theta from `settings` for every later `compute` without an explicit one
    pub fn follow_settings(&self, settings: watch::Receiver<PerformanceSettings>) {
        *self.inner.settings.lock() = Some(settings);
    }

    /// Theta of the followed settings right now
    fn followed_theta(&self) -> Option<f32> {
        let settings = self.inner.settings.lock();
        let theta = settings.as_ref()?.borrow().barnes_hut_theta;
        Some(theta)
    }

    /// Newest delivered batch; survives `failed` and `disposed`
    pub fn last_positions(&self) -> Option<PositionBatch> {
        self.inner.last_positions.lock().clone()
    }

    /// Send `initialize` and wait for the acknowledgement
    ///
    /// Fails the host with [`LayoutError::InitializationTimeout`] if no ack
    /// arrives within the configured timeout. Returns [`LayoutError::Disposed`]
    /// if the host is disposed before or while waiting.
    pub async fn initialize(&self, node_count: usize, parameters: SimulationParameters) -> Result<()> {
        parameters.validate()?;
        match self.state() {
            HostState::Disposed => return Err(LayoutError::Disposed),
            HostState::Uninitialized => {}
            state => return Err(violation(state, "initialize")),
        }
        if self
            .transition(&[HostState::Uninitialized], HostState::Initializing)
            .is_none()
        {
            return Err(self.refusal("initialize"));
        }

        let request = match self.post(HostRequest::Initialize {
            node_count,
            parameters,
        }) {
            Ok(id) => id,
            Err(err) => {
                self.fail(&err.to_string());
                return Err(err);
            }
        };

        let mut state_rx = self.inner.state.subscribe();
        let outcome = tokio::select! {
            biased;
            _ = wait_for_disposal(&mut state_rx) => return Err(LayoutError::Disposed),
            outcome = tokio::time::timeout(self.inner.init_timeout, self.await_ack(request)) => outcome,
        };

        match outcome {
            Ok(Ok(())) => {
                if self
                    .transition(&[HostState::Initializing], HostState::Running)
                    .is_none()
                {
                    return Err(self.refusal("initialize"));
                }
                Ok(())
            }
            Ok(Err(err)) => {
                self.fail(&err.to_string());
                Err(err)
            }
            Err(_) => {
                let err = LayoutError::InitializationTimeout {
                    timeout: self.inner.init_timeout,
                };
                self.fail(&err.to_string());
                Err(err)
            }
        }
    }

    async fn await_ack(&self, request: RequestId) -> Result<()> {
        let mut events = self.inner.events.lock().await;
        loop {
            let Some(envelope) = events.recv().await else {
                return Err(LayoutError::ExecutionUnitFailure(
                    "execution unit stopped before acknowledging initialize".to_string(),
                ));
            };
            if envelope.request != request {
                debug!(request = envelope.request, "ignoring event for an earlier request");
                continue;
            }
            match envelope.event {
                HostEvent::Initialized => return Ok(()),
                HostEvent::Error { error } => return Err(LayoutError::ExecutionUnitFailure(error)),
                other => debug!(event = ?other, "unexpected event while initializing"),
            }
        }
    }

    /// Ask the unit to lay out `nodes`/`edges`; batches follow through [`next_batch`](Self::next_batch)
    ///
    /// `theta` overrides, for this request only, the followed settings'
    /// theta, which in turn overrides the theta passed to `initialize`.
    ///
    /// Refused with a [`LayoutError::ProtocolViolation`] unless the host is
    /// running; a refused call has no side effects. An inline unit runs the
    /// whole simulation before this returns.
    pub fn compute(&self, nodes: Vec<Node>, edges: Vec<Edge>, theta: Option<f32>) -> Result<RequestId> {
        match self.state() {
            HostState::Running => {}
            HostState::Disposed => return Err(LayoutError::Disposed),
            state => return Err(violation(state, "compute")),
        }
        let theta = theta.or_else(|| self.followed_theta());
        if let Some(theta) = theta {
            debug!(theta, "compute with theta snapshot");
        }
        let result = self.post(HostRequest::Compute {
            nodes,
            edges,
            theta,
        });
        if let Err(err) = &result {
            self.fail(&err.to_string());
        }
        result
    }

    /// [`compute`](Self::compute) over a visibility projection
    pub fn compute_visible(&self, visible: VisibilityResult, theta: Option<f32>) -> Result<RequestId> {
        self.compute(visible.visible_nodes, visible.visible_edges, theta)
    }

    /// Wait for the next position batch
    ///
    /// Returns `Ok(None)` once the host is disposed, including when `dispose`
    /// is called while waiting. Batches older than one already delivered are
    /// dropped.
    pub async fn next_batch(&self) -> Result<Option<PositionBatch>> {
        match self.state() {
            HostState::Running => {}
            HostState::Disposed => return Ok(None),
            state => return Err(violation(state, "next_batch")),
        }

        let mut state_rx = self.inner.state.subscribe();
        let mut events = self.inner.events.lock().await;
        loop {
            let received = tokio::select! {
                biased;
                _ = wait_for_disposal(&mut state_rx) => return Ok(None),
                event = events.recv() => event,
            };
            let Some(envelope) = received else {
                let err = LayoutError::ExecutionUnitFailure(
                    "execution unit stopped unexpectedly".to_string(),
                );
                self.fail(&err.to_string());
                return Err(err);
            };

            match envelope.event {
                HostEvent::Positions {
                    step,
                    positions,
                    unstable,
                    done,
                } => {
                    let batch = PositionBatch {
                        request: envelope.request,
                        step,
                        positions,
                        unstable,
                        done,
                    };
                    if let Some(batch) = self.deliver(batch) {
                        return Ok(Some(batch));
                    }
                    if self.state() == HostState::Disposed {
                        return Ok(None);
                    }
                }
                HostEvent::Error { error } => {
                    self.fail(&error);
                    return Err(LayoutError::ExecutionUnitFailure(error));
                }
                HostEvent::Initialized | HostEvent::Disposed => {}
            }
        }
    }

    /// Run one compute request to its final batch
    ///
    /// The returned batch lists every node recovered during the request, not
    /// only those since the previous batch.
    pub async fn run_to_completion(
        &self,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
        theta: Option<f32>,
    ) -> Result<PositionBatch> {
        let request = self.compute(nodes, edges, theta)?;
        let mut unstable = Vec::new();
        loop {
            match self.next_batch().await? {
                Some(mut batch) if batch.request == request => {
                    unstable.append(&mut batch.unstable);
                    if batch.done {
                        unstable.sort();
                        unstable.dedup();
                        batch.unstable = unstable;
                        return Ok(batch);
                    }
                }
                Some(_) => {}
                None => return Err(LayoutError::Disposed),
            }
        }
    }

    /// Hand a batch to the caller unless disposed or out of order
    fn deliver(&self, batch: PositionBatch) -> Option<PositionBatch> {
        let _delivery = self.inner.delivery.lock();
        if self.state() != HostState::Running {
            return None;
        }

        let mut last_step = self.inner.last_step.lock();
        if last_step.is_some_and(|last| batch.step < last) {
            debug!(step = batch.step, last = ?*last_step, "dropping out-of-order batch");
            return None;
        }
        *last_step = Some(batch.step);

        for node in &batch.unstable {
            self.inner.observer.numeric_instability(node, batch.step);
        }
        self.inner
            .observer
            .positions_delivered(batch.step, batch.positions.len());
        *self.inner.last_positions.lock() = Some(batch.clone());
        Some(batch)
    }

    /// Tear the host down; safe from any state and idempotent
    ///
    /// Pending `initialize` and `next_batch` calls resolve immediately and no
    /// batch is delivered after this returns.
    pub fn dispose(&self) {
        let _delivery = self.inner.delivery.lock();
        let all = [
            HostState::Uninitialized,
            HostState::Initializing,
            HostState::Running,
            HostState::Failed,
        ];
        if self.transition(&all, HostState::Disposed).is_none() {
            return;
        }

        if let Some(mut unit) = self.inner.unit.lock().take() {
            let id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = unit.post(RequestEnvelope {
                id,
                request: HostRequest::Dispose,
            }) {
                debug!(error = %err, "execution unit gone before dispose");
            }
            unit.shutdown();
        }
    }

    fn post(&self, request: HostRequest) -> Result<RequestId> {
        let mut unit = self.inner.unit.lock();
        let unit = unit.as_mut().ok_or(LayoutError::Disposed)?;
        let id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        debug!(id, request = request.name(), "posting request");
        unit.post(RequestEnvelope { id, request })?;
        Ok(id)
    }

    /// Move to `to` if the current state is one of `from`; returns the previous state
    fn transition(&self, from: &[HostState], to: HostState) -> Option<HostState> {
        let mut previous = None;
        self.inner.state.send_if_modified(|state| {
            if from.contains(state) {
                previous = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });
        if let Some(previous) = previous {
            self.inner.observer.host_state_changed(previous, to);
        }
        previous
    }

    fn fail(&self, reason: &str) {
        if self
            .transition(&[HostState::Initializing, HostState::Running], HostState::Failed)
            .is_some()
        {
            warn!(reason, "simulation host failed");
            if let Some(mut unit) = self.inner.unit.lock().take() {
                unit.shutdown();
            }
        }
    }

    /// Error for an operation that lost a race with another state change
    fn refusal(&self, operation: &'static str) -> LayoutError {
        match self.state() {
            HostState::Disposed => LayoutError::Disposed,
            state => violation(state, operation),
        }
    }
}

fn violation(state: HostState, operation: &'static str) -> LayoutError {
    LayoutError::ProtocolViolation {
        state: state.as_str(),
        operation,
    }
}

async fn wait_for_disposal(state: &mut watch::Receiver<HostState>) {
    loop {
        if *state.borrow_and_update() == HostState::Disposed {
            return;
        }
        if state.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
