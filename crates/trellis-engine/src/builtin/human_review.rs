use futures::future::BoxFuture;
use tracing::info;

use trellis_core::error::Result;
use trellis_core::graph::Node;
use trellis_core::traits::{NodeContext, NodeOutcome, NodeProcessor};
use trellis_core::types::{event_types, Payload, StreamEvent};

/// Asks a human to weigh in, then parks the node until `resume_node`.
#[derive(Debug, Clone, Default)]
pub struct HumanReviewProcessor {
    pub timeout_minutes: u64,
    pub allow_skip: bool,
}

impl HumanReviewProcessor {
    /// Reads `timeout_minutes` and `allow_skip` from the node's properties.
    pub fn from_node(node: &Node) -> Self {
        Self {
            timeout_minutes: node.property_u64("timeout_minutes").unwrap_or(0),
            allow_skip: node.property_bool("allow_skip").unwrap_or(false),
        }
    }
}

impl NodeProcessor for HumanReviewProcessor {
    fn process(&self, ctx: NodeContext, _input: Payload) -> BoxFuture<'_, Result<NodeOutcome>> {
        Box::pin(async move {
            info!(node_id = %ctx.node_id(), timeout_minutes = self.timeout_minutes, "Human review requested");
            ctx.emit(
                StreamEvent::new(event_types::HUMAN_INTERACTION_REQUIRED)
                    .with_field("reason", "Human review required")
                    .with_field("timeout_minutes", self.timeout_minutes)
                    .with_field("allow_skip", self.allow_skip),
            )
            .await;
            Ok(NodeOutcome::Suspended)
        })
    }
}
