use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::event::EventSender;
use crate::graph::Node;
use crate::session::Session;
use crate::types::{NodeStatus, Payload, SessionId, StreamEvent};

/// Result of running one node's domain logic.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// The node finished; its output flows downstream.
    Completed(Payload),
    /// The node is parked until an external `resume_node` call. Not a failure.
    Suspended,
}

/// Everything a processor sees of the running workflow.
#[derive(Clone)]
pub struct NodeContext {
    pub session: Arc<Session>,
    pub node: Node,
    /// Session cancellation. Processors are expected to observe it.
    pub cancel: CancellationToken,
    pub events: EventSender,
}

impl NodeContext {
    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    /// Emit an event attributed to this node.
    pub async fn emit(&self, event: StreamEvent) {
        let event = if event.node_id.is_none() {
            event.with_node(self.node.id.clone())
        } else {
            event
        };
        self.events.emit(event).await;
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("session_id", self.session.id())
            .field("node_id", &self.node.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Executes one node's domain logic.
pub trait NodeProcessor: Send + Sync + 'static {
    /// Run the node. `input` always carries a `session_id` key.
    fn process(&self, ctx: NodeContext, input: Payload) -> BoxFuture<'_, Result<NodeOutcome>>;

    /// Optional conditional-routing capability.
    fn router(&self) -> Option<&dyn ConditionalRouter> {
        None
    }
}

/// Overrides a node's static `next_ids` from its output.
pub trait ConditionalRouter: Send + Sync {
    fn next_nodes<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        output: &'a Payload,
        default_next: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<String>>>;
}

/// Dependencies handed to a factory when it builds a processor.
#[derive(Clone)]
pub struct FactoryDeps {
    pub session: Arc<Session>,
}

/// Resolves a node definition to a processor instance.
pub trait NodeFactory: Send + Sync + 'static {
    fn create_node(&self, node: &Node, deps: &FactoryDeps) -> Result<Arc<dyn NodeProcessor>>;
}

/// Ordered interceptor around every node's processor.
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Runs before the processor. An error aborts the node.
    fn before_node_execution<'a>(
        &'a self,
        session: &'a Session,
        node: &'a Node,
    ) -> BoxFuture<'a, Result<()>> {
        let _ = (session, node);
        Box::pin(async { Ok(()) })
    }

    /// Runs after the processor and may rewrite the output. An error
    /// aborts the node.
    fn after_node_execution<'a>(
        &'a self,
        session: &'a Session,
        node: &'a Node,
        output: Payload,
    ) -> BoxFuture<'a, Result<Payload>> {
        let _ = (session, node);
        Box::pin(async move { Ok(output) })
    }
}

/// Optional sink for node status transitions.
pub trait SessionRepository: Send + Sync + 'static {
    fn update_node_status<'a>(
        &'a self,
        session_id: &'a SessionId,
        node_id: &'a str,
        status: NodeStatus,
    ) -> BoxFuture<'a, Result<()>>;
}
