use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use trellis_core::error::{Result, TrellisError};
use trellis_core::event::EventSender;
use trellis_core::graph::{GraphDefinition, Node};
use trellis_core::session::Session;
use trellis_core::traits::{
    FactoryDeps, Middleware, NodeContext, NodeFactory, NodeOutcome, NodeProcessor,
};
use trellis_core::types::{
    event_types, NodeStatus, Payload, SessionStatus, StreamEvent, SESSION_ID_KEY,
};
use trellis_core::validate::validate;

use crate::merge::{DefaultMergeStrategy, MergeStrategy};
use crate::persist::PersistQueue;

/// A node ready to dispatch, with its input.
type Work = (String, Payload);

/// What a single node dispatch produced, before downstream delivery.
enum Dispatch {
    /// Completed; `output` goes to `targets`.
    Routed { output: Payload, targets: Vec<String> },
    /// Parked until `resume_node`.
    Suspended,
    /// A parallel node; the downstream nodes its branches made ready.
    FannedOut(Vec<Work>),
}

/// Input for a downstream node that is ready to fire.
enum Ready {
    /// Loop-back or single input, used as-is.
    Direct(Payload),
    /// Several upstream outputs to combine.
    Merge(Vec<Payload>),
}

/// Fan-in accounting, guarded separately from node statuses.
struct JoinState {
    in_degree: HashMap<String, usize>,
    pending: HashMap<String, Vec<Payload>>,
}

/// Walks in flight and parked processors. One lock, so "no walk left and
/// nothing suspended" is decided atomically.
#[derive(Default)]
struct WalkState {
    /// The initial run plus every resumed delivery.
    walks: usize,
    /// Processors parked in `Suspended`, kept for routing on resume.
    suspended: HashMap<String, Arc<dyn NodeProcessor>>,
    first_error: Option<String>,
}

/// Factory used when none is configured.
struct UnconfiguredFactory;

impl NodeFactory for UnconfiguredFactory {
    fn create_node(&self, node: &Node, _deps: &FactoryDeps) -> Result<Arc<dyn NodeProcessor>> {
        Err(TrellisError::UnsupportedNodeType(node.node_type.to_string()))
    }
}

/// Executes one session's graph.
///
/// Walks depth-first from the start node off an explicit work stack, so
/// long chains and loops do not nest futures. Parallel nodes fan out one
/// task per branch; a node with several incoming edges fires once, after
/// every upstream delivery has arrived. No engine lock is held across a
/// processor call.
pub struct Engine {
    graph: Arc<GraphDefinition>,
    session: Arc<Session>,
    factory: Arc<dyn NodeFactory>,
    middlewares: Vec<Arc<dyn Middleware>>,
    merge: Arc<dyn MergeStrategy>,
    events: EventSender,
    persist: Option<PersistQueue>,
    status: RwLock<HashMap<String, NodeStatus>>,
    join: Mutex<JoinState>,
    walk: Mutex<WalkState>,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    session: Arc<Session>,
    events: EventSender,
    factory: Arc<dyn NodeFactory>,
    middlewares: Vec<Arc<dyn Middleware>>,
    merge: Arc<dyn MergeStrategy>,
    persist: Option<PersistQueue>,
}

impl EngineBuilder {
    pub fn factory(mut self, factory: impl NodeFactory) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    pub fn shared_factory(mut self, factory: Arc<dyn NodeFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Append a middleware. Hooks run in registration order.
    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn shared_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn merge_strategy(mut self, merge: impl MergeStrategy) -> Self {
        self.merge = Arc::new(merge);
        self
    }

    pub fn persistence(mut self, queue: PersistQueue) -> Self {
        self.persist = Some(queue);
        self
    }

    pub fn build(self) -> Arc<Engine> {
        let graph = self.session.graph().clone();
        let in_degree = graph.in_degrees();
        Arc::new(Engine {
            graph,
            session: self.session,
            factory: self.factory,
            middlewares: self.middlewares,
            merge: self.merge,
            events: self.events,
            persist: self.persist,
            status: RwLock::new(HashMap::new()),
            join: Mutex::new(JoinState {
                in_degree,
                pending: HashMap::new(),
            }),
            walk: Mutex::new(WalkState::default()),
        })
    }
}

impl Engine {
    /// Start building an engine for `session`, emitting into `events`.
    pub fn builder(session: Arc<Session>, events: EventSender) -> EngineBuilder {
        EngineBuilder {
            session,
            events,
            factory: Arc::new(UnconfiguredFactory),
            middlewares: Vec::new(),
            merge: Arc::new(DefaultMergeStrategy),
            persist: None,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn graph(&self) -> &Arc<GraphDefinition> {
        &self.graph
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    pub async fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.status.read().await.get(node_id).copied()
    }

    pub async fn statuses(&self) -> HashMap<String, NodeStatus> {
        self.status.read().await.clone()
    }

    /// Nodes currently parked in `Suspended`.
    pub async fn suspended_nodes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.walk.lock().await.suspended.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Validate the graph and execute it from the start node.
    ///
    /// Starts the session if it is still pending. Returns once the walk
    /// from the start node has finished or parked on suspended nodes; the
    /// error, if any, is the first one that walk hit.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        if let Err(e) = validate(&self.graph) {
            error!(graph_id = %self.graph.id, error = %e, "Graph validation failed");
            self.events
                .emit(StreamEvent::new(event_types::WORKFLOW_FAILED).with_field("error", e.to_string()))
                .await;
            if self.session.status().await.is_active() {
                // A concurrent stop may have won; that outcome stands.
                if let Err(fail_err) = self.session.fail(e.to_string()).await {
                    debug!(error = %fail_err, "Session already left the active state");
                }
            }
            return Err(e);
        }

        if self.session.status().await == SessionStatus::Pending {
            self.session.start(&CancellationToken::new()).await?;
        }

        info!(
            session_id = %self.session.id(),
            graph_id = %self.graph.id,
            nodes = self.graph.nodes.len(),
            "Workflow run started"
        );
        self.events
            .emit(
                StreamEvent::new(event_types::WORKFLOW_STARTED)
                    .with_field("session_id", self.session.id().to_string())
                    .with_field("workflow_id", self.graph.id.clone()),
            )
            .await;

        self.walk.lock().await.walks += 1;
        let start = (self.graph.start_node_id.clone(), self.session.inputs().clone());
        let result = self.walk_from(vec![start]).await;
        self.end_walk(&result).await;
        result
    }

    /// Complete a suspended node with externally supplied `output` and
    /// continue routing from it.
    ///
    /// Delivery runs in the background under the session's own
    /// cancellation, so this returns promptly; the handle resolves when the
    /// resumed walk finishes.
    pub async fn resume_node(
        self: &Arc<Self>,
        node_id: &str,
        output: Payload,
    ) -> Result<JoinHandle<Result<()>>> {
        {
            let mut status = self.status.write().await;
            match status.get(node_id) {
                None => return Err(TrellisError::NoNodeStatus(node_id.to_string())),
                Some(NodeStatus::Suspended) => {
                    status.insert(node_id.to_string(), NodeStatus::Completed);
                }
                Some(other) => {
                    return Err(TrellisError::NotSuspended {
                        node: node_id.to_string(),
                        status: other.to_string(),
                    })
                }
            }
        }
        let node = self
            .graph
            .node(node_id)
            .cloned()
            .ok_or_else(|| TrellisError::NodeNotFound(node_id.to_string()))?;

        info!(node_id = %node_id, "Resuming suspended node");
        let processor = {
            let mut walk = self.walk.lock().await;
            walk.walks += 1;
            walk.suspended.remove(node_id)
        };

        self.publish_status(node_id, NodeStatus::Completed).await;
        self.events
            .emit(StreamEvent::for_node(event_types::NODE_RESUMED, node_id).with_data(output.clone()))
            .await;

        let cancel = self.session.context().await;
        let engine = self.clone();
        Ok(tokio::spawn(async move {
            let routed = engine
                .route(&node, processor.as_deref(), &output, &cancel)
                .await;
            let result = match routed {
                Ok(targets) => {
                    let ready = engine.deliver_to_downstream(&node.id, output, targets).await;
                    engine.walk_from(ready).await
                }
                Err(e) => {
                    error!(node_id = %node.id, error = %e, "Routing after resume failed");
                    engine.events.emit(StreamEvent::error(&node.id, &e)).await;
                    Err(e)
                }
            };
            engine.end_walk(&result).await;
            result
        }))
    }

    // ── Dispatch ────────────────────────────────────────────────

    /// Dispatch `ready` and everything it makes ready, depth-first.
    ///
    /// A failed node ends its own path only; the rest of the stack still
    /// runs and the first error is returned.
    async fn walk_from(self: &Arc<Self>, ready: Vec<Work>) -> Result<()> {
        let mut stack: Vec<Work> = ready.into_iter().rev().collect();
        let mut first_err = None;

        while let Some((node_id, input)) = stack.pop() {
            match self.clone().run_node(node_id.clone(), input).await {
                Ok(Dispatch::Routed { output, targets }) => {
                    let next = self.deliver_to_downstream(&node_id, output, targets).await;
                    stack.extend(next.into_iter().rev());
                }
                Ok(Dispatch::FannedOut(next)) => stack.extend(next.into_iter().rev()),
                Ok(Dispatch::Suspended) => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Dispatch a node without delivering downstream.
    ///
    /// Pause gate, lookup, running status, before-middleware, session ID
    /// injection, processor, after-middleware, routing, completed status.
    fn run_node(self: Arc<Self>, node_id: String, mut input: Payload) -> BoxFuture<'static, Result<Dispatch>> {
        Box::pin(async move {
            let cancel = self.session.context().await;

            if self.session.is_paused() {
                self.events
                    .emit(
                        StreamEvent::for_node(event_types::EXECUTION_PAUSED, &node_id)
                            .with_field("reason", "session_paused"),
                    )
                    .await;
            }
            if let Err(e) = self.session.wait_if_paused(&cancel).await {
                warn!(node_id = %node_id, error = %e, "Dispatch abandoned");
                self.events.emit(StreamEvent::error(&node_id, &e)).await;
                self.update_status(&node_id, NodeStatus::Skipped).await;
                return Err(e);
            }

            let Some(node) = self.graph.node(&node_id).cloned() else {
                let err = TrellisError::NodeNotFound(node_id.clone());
                self.fail_node(&node_id, &err).await;
                return Err(err);
            };

            self.update_status(&node_id, NodeStatus::Running).await;

            for mw in &self.middlewares {
                if let Err(e) = mw.before_node_execution(&self.session, &node).await {
                    let err = TrellisError::MiddlewareRejected {
                        middleware: mw.name().to_string(),
                        node: node_id.clone(),
                        message: e.to_string(),
                    };
                    self.fail_node(&node_id, &err).await;
                    return Err(err);
                }
            }

            input.insert(
                SESSION_ID_KEY.to_string(),
                Value::String(self.session.id().to_string()),
            );

            if node.is_parallel() {
                let ready = self.handle_parallel(&node, input).await;
                return Ok(Dispatch::FannedOut(ready));
            }

            let deps = FactoryDeps {
                session: self.session.clone(),
            };
            let processor = match self.factory.create_node(&node, &deps) {
                Ok(p) => p,
                Err(e) => {
                    self.fail_node(&node_id, &e).await;
                    return Err(e);
                }
            };

            debug!(node_id = %node_id, node_type = %node.node_type, "Processing node");
            let ctx = NodeContext {
                session: self.session.clone(),
                node: node.clone(),
                cancel: cancel.clone(),
                events: self.events.clone(),
            };
            let outcome = processor.process(ctx, input).await;
            let mut output = match outcome {
                Ok(NodeOutcome::Completed(output)) => output,
                Ok(NodeOutcome::Suspended) => {
                    self.walk
                        .lock()
                        .await
                        .suspended
                        .insert(node_id.clone(), processor);
                    self.update_status(&node_id, NodeStatus::Suspended).await;
                    info!(node_id = %node_id, "Node suspended, awaiting resume");
                    return Ok(Dispatch::Suspended);
                }
                Err(e) => {
                    self.fail_node(&node_id, &e).await;
                    return Err(e);
                }
            };

            for mw in &self.middlewares {
                output = match mw.after_node_execution(&self.session, &node, output).await {
                    Ok(o) => o,
                    Err(e) => {
                        let err = TrellisError::MiddlewareFailed {
                            middleware: mw.name().to_string(),
                            node: node_id.clone(),
                            message: e.to_string(),
                        };
                        self.fail_node(&node_id, &err).await;
                        return Err(err);
                    }
                };
            }

            let routed = self
                .route(&node, Some(processor.as_ref()), &output, &cancel)
                .await;
            let targets = match routed {
                Ok(targets) => targets,
                Err(e) => {
                    self.fail_node(&node_id, &e).await;
                    return Err(e);
                }
            };

            self.update_status(&node_id, NodeStatus::Completed).await;
            Ok(Dispatch::Routed { output, targets })
        })
    }

    /// Fan a parallel node out to one task per branch.
    ///
    /// Every branch runs to completion before the parallel node completes;
    /// only then are the successful branches' outputs delivered, in branch
    /// order. A failed branch is left out without affecting its siblings.
    /// Returns the downstream nodes those deliveries made ready.
    async fn handle_parallel(self: &Arc<Self>, node: &Node, input: Payload) -> Vec<Work> {
        self.events
            .emit(
                StreamEvent::for_node(event_types::PARALLEL_START, &node.id)
                    .with_field("branches", node.next_ids.clone()),
            )
            .await;
        debug!(node_id = %node.id, branches = node.next_ids.len(), "Parallel fan-out");

        let handles: Vec<_> = node
            .next_ids
            .iter()
            .map(|branch_id| tokio::spawn(self.clone().run_node(branch_id.clone(), input.clone())))
            .collect();
        let results = join_all(handles).await;

        self.update_status(&node.id, NodeStatus::Completed).await;

        let mut ready = Vec::new();
        for (branch_id, joined) in node.next_ids.iter().zip(results) {
            match joined {
                Ok(Ok(Dispatch::Routed { output, targets })) => {
                    ready.extend(self.deliver_to_downstream(branch_id, output, targets).await);
                }
                Ok(Ok(Dispatch::FannedOut(nested))) => ready.extend(nested),
                Ok(Ok(Dispatch::Suspended)) => {}
                Ok(Err(e)) => {
                    warn!(parallel = %node.id, branch = %branch_id, error = %e, "Parallel branch failed, excluded from delivery");
                }
                Err(e) => {
                    let err = TrellisError::node_failed(branch_id.clone(), format!("branch task aborted: {}", e));
                    self.fail_node(branch_id, &err).await;
                }
            }
        }
        ready
    }

    /// Next nodes for a completed node: the processor's router if it has
    /// one, the static edges otherwise.
    async fn route(
        &self,
        node: &Node,
        processor: Option<&dyn NodeProcessor>,
        output: &Payload,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        match processor.and_then(|p| p.router()) {
            Some(router) => router.next_nodes(cancel, output, &node.next_ids).await,
            None => Ok(node.next_ids.clone()),
        }
    }

    // ── Join ────────────────────────────────────────────────────

    /// Deliver `output` from `node_id` to each of `targets` and return the
    /// targets that are now ready, in target order.
    ///
    /// A target is ready once its accumulated deliveries reach its static
    /// in-degree. A loop node's delivery along its own loop-back edge skips
    /// the accounting and is ready at once. Only the accounting is done
    /// under the join lock.
    async fn deliver_to_downstream(
        &self,
        node_id: &str,
        output: Payload,
        targets: Vec<String>,
    ) -> Vec<Work> {
        if targets.is_empty() {
            debug!(node_id = %node_id, "Terminal node, branch complete");
            self.session
                .set_output(node_id, Value::Object(output))
                .await;
            return Vec::new();
        }

        let loop_back = self.graph.node(node_id).and_then(Node::loop_back_target);
        let single_target = targets.len() == 1;

        let mut ready_nodes = Vec::new();
        for next_id in targets {
            let is_loop_back = single_target && loop_back == Some(next_id.as_str());

            let ready = {
                let mut guard = self.join.lock().await;
                let join = &mut *guard;
                if is_loop_back {
                    join.pending.remove(&next_id);
                    Some(Ready::Direct(output.clone()))
                } else {
                    let pending = join.pending.entry(next_id.clone()).or_default();
                    pending.push(output.clone());
                    let expected = join.in_degree.get(&next_id).copied().unwrap_or(0);
                    if pending.len() >= expected {
                        let mut inputs = std::mem::take(pending);
                        if inputs.len() == 1 {
                            inputs.pop().map(Ready::Direct)
                        } else {
                            Some(Ready::Merge(inputs))
                        }
                    } else {
                        debug!(
                            from = %node_id,
                            to = %next_id,
                            received = pending.len(),
                            expected,
                            "Join waiting for upstream branches"
                        );
                        None
                    }
                }
            };

            match ready {
                None => {}
                Some(Ready::Direct(input)) => ready_nodes.push((next_id, input)),
                Some(Ready::Merge(inputs)) => {
                    debug!(to = %next_id, inputs = inputs.len(), "Join satisfied, merging inputs");
                    ready_nodes.push((next_id, self.merge.merge(inputs)));
                }
            }
        }
        ready_nodes
    }

    // ── Status ──────────────────────────────────────────────────

    async fn update_status(&self, node_id: &str, status: NodeStatus) {
        self.status.write().await.insert(node_id.to_string(), status);
        self.publish_status(node_id, status).await;
    }

    /// Broadcast a transition and queue it for persistence.
    async fn publish_status(&self, node_id: &str, status: NodeStatus) {
        self.events.emit(StreamEvent::state_change(node_id, status)).await;
        if let Some(queue) = &self.persist {
            queue.enqueue(self.session.id(), node_id, status);
        }
    }

    /// Emit the error, then mark the node failed.
    async fn fail_node(&self, node_id: &str, err: &TrellisError) {
        error!(node_id = %node_id, error = %err, "Node failed");
        self.events.emit(StreamEvent::error(node_id, err)).await;
        self.update_status(node_id, NodeStatus::Failed).await;
    }

    /// Close out one walk; the last one finalises the session unless a
    /// node is still suspended.
    async fn end_walk(&self, result: &Result<()>) {
        let walk_error = {
            let mut walk = self.walk.lock().await;
            if let Err(e) = result {
                walk.first_error.get_or_insert_with(|| e.to_string());
            }
            walk.walks = walk.walks.saturating_sub(1);
            if walk.walks > 0 {
                return;
            }
            if !walk.suspended.is_empty() {
                info!(suspended = walk.suspended.len(), "Workflow parked on suspended nodes");
                return;
            }
            walk.first_error.take()
        };

        if !self.session.status().await.is_active() {
            return;
        }

        match walk_error {
            None => {
                if self.session.complete().await.is_ok() {
                    info!(session_id = %self.session.id(), "Workflow completed");
                    self.events
                        .emit(StreamEvent::new(event_types::WORKFLOW_COMPLETED))
                        .await;
                }
            }
            Some(reason) => {
                if self.session.fail(reason.clone()).await.is_ok() {
                    warn!(session_id = %self.session.id(), error = %reason, "Workflow failed");
                    self.events
                        .emit(StreamEvent::new(event_types::WORKFLOW_FAILED).with_field("error", reason))
                        .await;
                }
            }
        }
    }
}
