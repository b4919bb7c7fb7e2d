//! The request handler run by every execution unit
//!
//! [`LayoutWorker`] owns the simulation state on its side of the boundary and
//! turns each request into zero or more events. Inline and background units
//! both drive the same worker, so the protocol is identical for the two.

use std::ops::ControlFlow;

use tracing::debug;

use super::protocol::{EventEnvelope, HostEvent, HostRequest, RequestEnvelope, RequestId};
use crate::graph_types::{Edge, Node};
use crate::simulation::{ForceSimulator, SimulationParameters};

/// Destination for events produced by a worker
pub trait EventSink {
    /// Deliver one event; `Break` means nobody is listening any more
    fn emit(&mut self, event: EventEnvelope) -> ControlFlow<()>;

    /// Checked between simulation steps
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Simulation state machine on the execution-unit side
#[derive(Debug)]
pub struct LayoutWorker {
    batch_interval: u64,
    parameters: Option<SimulationParameters>,
    announced_nodes: usize,
    /// Steps completed across all compute requests, so batch steps never go back
    steps_completed: u64,
    disposed: bool,
}

impl LayoutWorker {
    pub fn new(batch_interval: usize) -> Self {
        Self {
            batch_interval: batch_interval.max(1) as u64,
            parameters: None,
            announced_nodes: 0,
            steps_completed: 0,
            disposed: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.parameters.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Handle one request; `Break` tells the unit to stop its loop
    pub fn handle(&mut self, envelope: RequestEnvelope, sink: &mut dyn EventSink) -> ControlFlow<()> {
        let RequestEnvelope { id, request } = envelope;
        if self.disposed {
            debug!(request = request.name(), "worker disposed, dropping request");
            return ControlFlow::Break(());
        }

        match request {
            HostRequest::Initialize {
                node_count,
                parameters,
            } => {
                if let Err(err) = parameters.validate() {
                    return sink.emit(EventEnvelope::new(
                        id,
                        HostEvent::Error {
                            error: err.to_string(),
                        },
                    ));
                }
                self.announced_nodes = node_count;
                self.parameters = Some(parameters);
                debug!(node_count, "worker initialized");
                sink.emit(EventEnvelope::new(id, HostEvent::Initialized))
            }
            HostRequest::Compute {
                nodes,
                edges,
                theta,
            } => self.compute(id, &nodes, &edges, theta, sink),
            HostRequest::Dispose => {
                self.disposed = true;
                self.parameters = None;
                let _ = sink.emit(EventEnvelope::new(id, HostEvent::Disposed));
                ControlFlow::Break(())
            }
        }
    }

    fn compute(
        &mut self,
        id: RequestId,
        nodes: &[Node],
        edges: &[Edge],
        theta: Option<f32>,
        sink: &mut dyn EventSink,
    ) -> ControlFlow<()> {
        let Some(parameters) = self.parameters.clone() else {
            return sink.emit(EventEnvelope::new(
                id,
                HostEvent::Error {
                    error: "compute issued before initialize".to_string(),
                },
            ));
        };
        if nodes.len() != self.announced_nodes {
            debug!(
                announced = self.announced_nodes,
                actual = nodes.len(),
                "compute graph differs in size from initialize"
            );
        }

        let mut simulator = ForceSimulator::new(nodes, edges, parameters);
        if let Some(theta) = theta {
            simulator.set_theta(theta);
        }

        let base = self.steps_completed;
        let interval = self.batch_interval;
        let mut unstable = Vec::new();
        let mut flow = ControlFlow::Continue(());

        let summary = simulator.run_with(|result, sim| {
            unstable.extend(result.recovered.iter().cloned());
            if sink.is_cancelled() {
                flow = ControlFlow::Break(());
            } else if result.step % interval == 0 {
                flow = sink.emit(EventEnvelope::new(
                    id,
                    HostEvent::Positions {
                        step: base + result.step,
                        positions: sim.positions(),
                        unstable: std::mem::take(&mut unstable),
                        done: false,
                    },
                ));
            }
            flow
        });
        self.steps_completed = base + simulator.step();

        if flow.is_break() {
            debug!(step = self.steps_completed, "compute cancelled");
            return flow;
        }

        debug!(
            iterations = summary.iterations,
            converged = summary.converged,
            "compute finished"
        );
        sink.emit(EventEnvelope::new(
            id,
            HostEvent::Positions {
                step: self.steps_completed,
                positions: simulator.positions(),
                unstable,
                done: true,
            },
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Collects events in memory
    #[derive(Default)]
    pub(crate) struct VecSink {
        pub events: Vec<EventEnvelope>,
        pub cancel_after: Option<usize>,
    }

    impl EventSink for VecSink {
        fn emit(&mut self, event: EventEnvelope) -> ControlFlow<()> {
            self.events.push(event);
            ControlFlow::Continue(())
        }

        fn is_cancelled(&self) -> bool {
            self.cancel_after
                .is_some_and(|limit| self.events.len() >= limit)
        }
    }

    fn params(iteration_cap: usize) -> SimulationParameters {
        SimulationParameters {
            iteration_cap,
            convergence_epsilon: 1e-9,
            ..SimulationParameters::default()
        }
    }

    fn graph() -> (Vec<Node>, Vec<Edge>) {
        let nodes = vec![
            Node::new("a").at(-5.0, 0.0, 0.0),
            Node::new("b").at(5.0, 0.0, 0.0),
            Node::new("c").at(0.0, 5.0, 0.0),
        ];
        let edges = vec![Edge::new("ab", "a", "b"), Edge::new("bc", "b", "c")];
        (nodes, edges)
    }

    fn request(id: RequestId, request: HostRequest) -> RequestEnvelope {
        RequestEnvelope { id, request }
    }

    fn compute_request(id: RequestId) -> RequestEnvelope {
        let (nodes, edges) = graph();
        request(
            id,
            HostRequest::Compute {
                nodes,
                edges,
                theta: None,
            },
        )
    }

    fn summary(events: &[EventEnvelope]) -> Vec<String> {
        events
            .iter()
            .map(|e| match &e.event {
                HostEvent::Initialized => format!("{} initialized", e.request),
                HostEvent::Positions {
                    step,
                    positions,
                    done,
                    ..
                } => format!("{} positions step={step} n={} done={done}", e.request, positions.len()),
                HostEvent::Error { error } => format!("{} error: {error}", e.request),
                HostEvent::Disposed => format!("{} disposed", e.request),
            })
            .collect()
    }

    #[test]
    fn compute_before_initialize_reports_error() {
        let mut worker = LayoutWorker::new(10);
        let mut sink = VecSink::default();
        assert!(worker.handle(compute_request(1), &mut sink).is_continue());
        insta::assert_snapshot!(summary(&sink.events).join("\n"), @"1 error: compute issued before initialize");
        assert!(!worker.is_initialized());
    }

    #[test]
    fn invalid_parameters_are_rejected_at_initialize() {
        let mut worker = LayoutWorker::new(10);
        let mut sink = VecSink::default();
        let bad = SimulationParameters {
            damping: 1.5,
            ..SimulationParameters::default()
        };
        worker.handle(
            request(
                1,
                HostRequest::Initialize {
                    node_count: 3,
                    parameters: bad,
                },
            ),
            &mut sink,
        );
        assert!(matches!(sink.events[0].event, HostEvent::Error { .. }));
        assert!(!worker.is_initialized());
    }

    #[test]
    fn streams_batches_then_final() {
        let mut worker = LayoutWorker::new(10);
        let mut sink = VecSink::default();
        worker.handle(
            request(
                1,
                HostRequest::Initialize {
                    node_count: 3,
                    parameters: params(25),
                },
            ),
            &mut sink,
        );
        worker.handle(compute_request(2), &mut sink);

        insta::assert_snapshot!(summary(&sink.events).join("\n"), @r"
        1 initialized
        2 positions step=10 n=3 done=false
        2 positions step=20 n=3 done=false
        2 positions step=25 n=3 done=true
        ");
    }

    #[test]
    fn steps_keep_increasing_across_computes() {
        let mut worker = LayoutWorker::new(4);
        let mut sink = VecSink::default();
        worker.handle(
            request(
                1,
                HostRequest::Initialize {
                    node_count: 3,
                    parameters: params(6),
                },
            ),
            &mut sink,
        );
        worker.handle(compute_request(2), &mut sink);
        worker.handle(compute_request(3), &mut sink);

        insta::assert_snapshot!(summary(&sink.events).join("\n"), @r"
        1 initialized
        2 positions step=4 n=3 done=false
        2 positions step=6 n=3 done=true
        3 positions step=10 n=3 done=false
        3 positions step=12 n=3 done=true
        ");
    }

    #[test]
    fn cancellation_stops_without_final_batch() {
        let mut worker = LayoutWorker::new(5);
        let mut sink = VecSink {
            cancel_after: Some(2),
            ..VecSink::default()
        };
        worker.handle(
            request(
                1,
                HostRequest::Initialize {
                    node_count: 3,
                    parameters: params(100),
                },
            ),
            &mut sink,
        );
        assert!(worker.handle(compute_request(2), &mut sink).is_break());

        insta::assert_snapshot!(summary(&sink.events).join("\n"), @r"
        1 initialized
        2 positions step=5 n=3 done=false
        ");
    }

    #[test]
    fn dispose_acknowledges_and_ignores_later_requests() {
        let mut worker = LayoutWorker::new(10);
        let mut sink = VecSink::default();
        assert!(worker.handle(request(1, HostRequest::Dispose), &mut sink).is_break());
        assert!(worker.is_disposed());
        assert!(worker.handle(compute_request(2), &mut sink).is_break());

        insta::assert_snapshot!(summary(&sink.events).join("\n"), @"1 disposed");
    }

    #[test]
    fn theta_override_is_applied() {
        let mut worker = LayoutWorker::new(100);
        let mut sink = VecSink::default();
        worker.handle(
            request(
                1,
                HostRequest::Initialize {
                    node_count: 0,
                    parameters: params(3),
                },
            ),
            &mut sink,
        );
        let (nodes, edges) = graph();
        worker.handle(
            request(
                2,
                HostRequest::Compute {
                    nodes,
                    edges,
                    theta: Some(0.0),
                },
            ),
            &mut sink,
        );
        let Some(HostEvent::Positions { positions, done, .. }) = sink.events.last().map(|e| &e.event)
        else {
            panic!("expected a final positions batch");
        };
        assert!(*done);
        assert_eq!(positions.len(), 3);
        assert!(positions.iter().all(|p| p.to_vec3().is_finite()));
    }
}
