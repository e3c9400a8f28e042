use futures::future::BoxFuture;

use trellis_core::error::Result;
use trellis_core::traits::{NodeContext, NodeOutcome, NodeProcessor};
use trellis_core::types::Payload;

/// Forwards its input unchanged. Backs `start` and `end` nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughProcessor;

impl NodeProcessor for PassthroughProcessor {
    fn process(&self, _ctx: NodeContext, input: Payload) -> BoxFuture<'_, Result<NodeOutcome>> {
        Box::pin(async move { Ok(NodeOutcome::Completed(input)) })
    }
}
