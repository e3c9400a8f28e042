use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrellisError {
    // Graph structure errors
    #[error("Graph has no nodes")]
    EmptyGraph,

    #[error("Start node not found: {0}")]
    StartNodeNotFound(String),

    #[error("Node ID mismatch: map key {key} vs node.id {id}")]
    NodeIdMismatch { key: String, id: String },

    #[error("Node {from} points to non-existent node {to}")]
    DanglingEdge { from: String, to: String },

    #[error("Graph contains unreachable nodes (visited {visited}/{total})")]
    UnreachableNodes { visited: usize, total: usize },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    // Factory errors
    #[error("No processor registered for node type: {0}")]
    UnsupportedNodeType(String),

    // Execution errors
    #[error("Node {node} failed: {message}")]
    NodeExecution { node: String, message: String },

    #[error("Middleware {middleware} blocked execution of {node}: {message}")]
    MiddlewareRejected {
        middleware: String,
        node: String,
        message: String,
    },

    #[error("Middleware {middleware} failed post-processing of {node}: {message}")]
    MiddlewareFailed {
        middleware: String,
        node: String,
        message: String,
    },

    #[error("Execution cancelled")]
    Cancelled,

    // Conflict errors
    #[error("Node {node} is not suspended (status: {status})")]
    NotSuspended { node: String, status: String },

    #[error("Node {0} not found in execution status")]
    NoNodeStatus(String),

    #[error("Node {0} is not waiting for a signal")]
    SignalNotWaiting(String),

    #[error("Signal channel for node {0} is full")]
    SignalChannelFull(String),

    // Session errors
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // Storage errors
    #[error("Persistence error: {0}")]
    Persistence(String),

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

impl TrellisError {
    /// Shorthand for a processor failure on `node`.
    pub fn node_failed(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Whether this error belongs to the structural class (graph shape).
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::EmptyGraph
                | Self::StartNodeNotFound(_)
                | Self::NodeIdMismatch { .. }
                | Self::DanglingEdge { .. }
                | Self::UnreachableNodes { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TrellisError>;
