//! Error taxonomy for the layout engine
//!
//! Terminal host failures (`InitializationTimeout`, `ExecutionUnitFailure`) move a
//! [`SimulationHost`](crate::host::SimulationHost) into its `failed` state and are
//! never retried internally. Visibility queries never produce errors; they return
//! empty results for unknown ids.

use std::time::Duration;

use thiserror::Error;

use crate::graph_types::NodeId;

/// Errors that can occur while projecting, simulating or hosting a layout
#[derive(Error, Debug)]
pub enum LayoutError {
    /// The execution unit did not acknowledge `initialize` in time
    #[error("simulation host did not acknowledge initialization within {timeout:?}")]
    InitializationTimeout { timeout: Duration },

    /// The execution unit crashed or reported an error
    #[error("execution unit failure: {0}")]
    ExecutionUnitFailure(String),

    /// A node id does not exist in the simulated graph
    #[error("unknown node id: {0}")]
    InvalidGraphReference(NodeId),

    /// Non-finite values were produced while integrating a node
    #[error("numeric instability at node {node} (step {step})")]
    NumericInstability { node: NodeId, step: u64 },

    /// An operation was issued in a lifecycle state that does not allow it
    #[error("protocol violation: {operation} is not allowed while {state}")]
    ProtocolViolation {
        state: &'static str,
        operation: &'static str,
    },

    /// The host was disposed while the operation was pending
    #[error("simulation host has been disposed")]
    Disposed,

    /// A configuration or simulation parameter is out of range
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The file format is not supported
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// An I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization failed
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl LayoutError {
    /// Whether this error leaves a host in its terminal `failed` state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LayoutError::InitializationTimeout { .. } | LayoutError::ExecutionUnitFailure(_)
        )
    }
}

/// Result type for layout engine operations
pub type Result<T> = std::result::Result<T, LayoutError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = LayoutError::InvalidGraphReference("n42".to_string());
        assert_eq!(err.to_string(), "unknown node id: n42");

        let err = LayoutError::ProtocolViolation {
            state: "uninitialized",
            operation: "compute",
        };
        assert_eq!(
            err.to_string(),
            "protocol violation: compute is not allowed while uninitialized"
        );

        let err = LayoutError::InitializationTimeout {
            timeout: Duration::from_secs(5),
        };
        assert_eq!(
            err.to_string(),
            "simulation host did not acknowledge initialization within 5s"
        );
    }

    #[test]
    fn only_host_failures_are_terminal() {
        assert!(
            LayoutError::InitializationTimeout {
                timeout: Duration::from_millis(10)
            }
            .is_terminal()
        );
        assert!(LayoutError::ExecutionUnitFailure("boom".into()).is_terminal());
        assert!(!LayoutError::Disposed.is_terminal());
        assert!(
            !LayoutError::NumericInstability {
                node: "a".into(),
                step: 3
            }
            .is_terminal()
        );
    }
}
