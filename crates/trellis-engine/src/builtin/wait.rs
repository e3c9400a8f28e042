use futures::future::BoxFuture;
use tracing::debug;

use trellis_core::error::Result;
use trellis_core::traits::{NodeContext, NodeOutcome, NodeProcessor};
use trellis_core::types::Payload;

/// Output key carrying the delivered signal payload.
pub const SIGNAL_KEY: &str = "signal";

/// Blocks until an external signal addressed to this node arrives.
///
/// The output is the node's input with the payload added under `signal`.
/// Unlike a suspension, the node stays `running` while it waits.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitSignalProcessor;

impl NodeProcessor for WaitSignalProcessor {
    fn process(&self, ctx: NodeContext, mut input: Payload) -> BoxFuture<'_, Result<NodeOutcome>> {
        Box::pin(async move {
            debug!(node_id = %ctx.node_id(), "Waiting for external signal");
            let payload = ctx.session.wait_for_signal(ctx.node_id()).await?;
            input.insert(SIGNAL_KEY.to_string(), payload);
            Ok(NodeOutcome::Completed(input))
        })
    }
}
