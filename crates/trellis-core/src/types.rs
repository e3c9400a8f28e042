use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Input/output bag exchanged between nodes.
///
/// Insertion order is preserved so merged payloads read in branch order.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Key the engine injects into every node input.
pub const SESSION_ID_KEY: &str = "session_id";

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Runtime status of a single node, owned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Suspended,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Suspended => "suspended",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a session.
///
/// `Paused` is a sub-state of running: only a running session can pause and
/// a paused session resumes back to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Running or paused.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known stream event types emitted by the engine.
pub mod event_types {
    pub const NODE_STATE_CHANGE: &str = "node_state_change";
    pub const ERROR: &str = "error";
    pub const EXECUTION_PAUSED: &str = "execution:paused";
    pub const PARALLEL_START: &str = "node:parallel_start";
    pub const NODE_RESUMED: &str = "node_resumed";
    pub const WORKFLOW_STARTED: &str = "workflow:started";
    pub const WORKFLOW_COMPLETED: &str = "workflow:completed";
    pub const WORKFLOW_FAILED: &str = "workflow:failed";
    pub const HUMAN_INTERACTION_REQUIRED: &str = "human_interaction_required";
}

/// Lifecycle notification pushed to external observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
}

impl StreamEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            node_id: None,
            data: None,
        }
    }

    pub fn for_node(event_type: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self::new(event_type).with_node(node_id)
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_data(mut self, data: Payload) -> Self {
        self.data = Some(data);
        self
    }

    /// Insert a single data field, creating the bag if needed.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data
            .get_or_insert_with(Payload::new)
            .insert(key.into(), value.into());
        self
    }

    /// `node_state_change` carrying the new status.
    pub fn state_change(node_id: impl Into<String>, status: NodeStatus) -> Self {
        Self::for_node(event_types::NODE_STATE_CHANGE, node_id).with_field("status", status.as_str())
    }

    /// `error` event carrying the error text.
    pub fn error(node_id: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::for_node(event_types::ERROR, node_id).with_field("error", error.to_string())
    }

    /// Look up a data field.
    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.as_ref().and_then(|d| d.get(key))
    }
}
