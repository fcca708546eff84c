use thiserror::Error;

use crate::state::State;
use crate::trace::TraceEvent;

#[derive(Debug, Error)]
pub enum StrataError {
    // Graph construction errors
    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    #[error("Unknown node '{name}' ({context})")]
    UnknownNode { name: String, context: String },

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    // Node execution errors
    #[error("Node timeout after {timeout_ms}ms: {node}")]
    NodeTimeout { node: String, timeout_ms: u64 },

    #[error("Node operation failed: {node}: {message}")]
    Operation { node: String, message: String },

    #[error("Node {node} failed after {attempts} attempt(s): {source}")]
    NodeExecution {
        node: String,
        attempts: u32,
        #[source]
        source: Box<StrataError>,
    },

    // Merge errors
    #[error("Conflicting write to '{key}' from nodes {nodes:?}")]
    ConflictingWrite { key: String, nodes: Vec<String> },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StrataError {
    /// Failure reported by a node operation.
    ///
    /// The node name is filled in by the reliability wrapper when it is left
    /// empty, so operations can simply return `StrataError::operation("...")`.
    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation {
            node: String::new(),
            message: message.into(),
        }
    }

    pub fn unknown_node(name: impl Into<String>, context: impl Into<String>) -> Self {
        Self::UnknownNode {
            name: name.into(),
            context: context.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;

/// A run that aborted.
///
/// Carries the state as merged before the failing superstep and the trace
/// recorded up to the abort, so callers can localize the failing node.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunError {
    #[source]
    pub error: StrataError,
    pub state: State,
    pub trace: Vec<TraceEvent>,
}

impl RunError {
    pub fn new(error: StrataError, state: State, trace: Vec<TraceEvent>) -> Self {
        Self {
            error,
            state,
            trace,
        }
    }

    /// Name of the node that exhausted its retries, if that is why the run stopped.
    pub fn failed_node(&self) -> Option<&str> {
        match &self.error {
            StrataError::NodeExecution { node, .. } => Some(node),
            _ => None,
        }
    }
}
