//! Execution units: where the worker actually runs
//!
//! An [`ExecutionUnit`] accepts requests and reports events through a tokio
//! channel handed to it at construction. [`InlineUnit`] handles each request on
//! the caller's thread before `post` returns; [`BackgroundUnit`] forwards them
//! to a dedicated OS thread.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use super::protocol::{EventEnvelope, RequestEnvelope};
use super::worker::{EventSink, LayoutWorker};
use crate::error::{LayoutError, Result};

/// Where a host runs its worker, after `auto` has been resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStrategy {
    Inline,
    Background,
}

/// Something that can run a [`LayoutWorker`]
pub trait ExecutionUnit: Send {
    /// Hand a request to the unit
    fn post(&mut self, request: RequestEnvelope) -> Result<()>;

    /// Stop the unit; no events are produced afterwards
    fn shutdown(&mut self);
}

/// Sends worker events into the host's channel
struct ChannelSink<'a> {
    events: &'a UnboundedSender<EventEnvelope>,
    stop: Option<&'a AtomicBool>,
}

impl EventSink for ChannelSink<'_> {
    fn emit(&mut self, event: EventEnvelope) -> ControlFlow<()> {
        if self.is_cancelled() || self.events.send(event).is_err() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    fn is_cancelled(&self) -> bool {
        self.stop.is_some_and(|stop| stop.load(Ordering::Acquire))
    }
}

/// Runs the worker synchronously inside `post`
pub struct InlineUnit {
    worker: LayoutWorker,
    events: Option<UnboundedSender<EventEnvelope>>,
}

impl InlineUnit {
    pub fn new(batch_interval: usize, events: UnboundedSender<EventEnvelope>) -> Self {
        Self {
            worker: LayoutWorker::new(batch_interval),
            events: Some(events),
        }
    }
}

impl ExecutionUnit for InlineUnit {
    fn post(&mut self, request: RequestEnvelope) -> Result<()> {
        let events = self.events.as_ref().ok_or(LayoutError::Disposed)?;
        let mut sink = ChannelSink { events, stop: None };
        if self.worker.handle(request, &mut sink).is_break() {
            debug!(disposed = self.worker.is_disposed(), "inline layout worker stopped");
            self.events = None;
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.events = None;
    }
}

/// Runs the worker on its own thread, detached once shut down
pub struct BackgroundUnit {
    requests: Option<mpsc::Sender<RequestEnvelope>>,
    stop: Arc<AtomicBool>,
}

impl BackgroundUnit {
    pub fn spawn(batch_interval: usize, events: UnboundedSender<EventEnvelope>) -> Result<Self> {
        let (requests, inbox) = mpsc::channel::<RequestEnvelope>();
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);

        thread::Builder::new()
            .name("layout-worker".to_string())
            .spawn(move || {
                let mut worker = LayoutWorker::new(batch_interval);
                let mut sink = ChannelSink {
                    events: &events,
                    stop: Some(&worker_stop),
                };
                while let Ok(request) = inbox.recv() {
                    if worker_stop.load(Ordering::Acquire) {
                        break;
                    }
                    if worker.handle(request, &mut sink).is_break() {
                        break;
                    }
                }
                debug!("layout worker thread exiting");
            })
            .map_err(|err| {
                LayoutError::ExecutionUnitFailure(format!("could not spawn worker thread: {err}"))
            })?;

        Ok(Self {
            requests: Some(requests),
            stop,
        })
    }
}

impl ExecutionUnit for BackgroundUnit {
    fn post(&mut self, request: RequestEnvelope) -> Result<()> {
        let requests = self.requests.as_ref().ok_or(LayoutError::Disposed)?;
        requests.send(request).map_err(|_| {
            LayoutError::ExecutionUnitFailure("background worker is not running".to_string())
        })
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        // An idle thread wakes on the closed inbox, a busy one at its next step
        self.requests = None;
    }
}

impl Drop for BackgroundUnit {
    fn drop(&mut self) {
        self.shutdown();
    }
}
