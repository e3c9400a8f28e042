//! Shared mocks and graph fixtures for Trellis tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use trellis_core::error::{Result, TrellisError};
use trellis_core::event::EventReceiver;
use trellis_core::graph::{GraphDefinition, Node};
use trellis_core::session::Session;
use trellis_core::traits::{FactoryDeps, Middleware, NodeContext, NodeFactory, NodeOutcome, NodeProcessor};
use trellis_core::types::{event_types, NodeStatus, Payload, StreamEvent};

/// Turn a JSON object literal into a [`Payload`].
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

// ── Mock processors ─────────────────────────────────────────────

/// What a [`RecordingFactory`] processor does for one node.
#[derive(Clone)]
pub enum Behavior {
    /// Echo the input plus `{"from": <node>, <node>: true}`.
    Echo,
    /// Echo, after sleeping.
    Delay(Duration),
    /// Return this output.
    Output(Payload),
    Fail(String),
    Suspend,
    /// Delegate to a real processor.
    Processor(Arc<dyn NodeProcessor>),
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(String, Payload)>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Factory whose processors record every invocation.
///
/// Nodes without a configured [`Behavior`] echo.
#[derive(Clone, Default)]
pub struct RecordingFactory {
    behaviors: Arc<Mutex<HashMap<String, Behavior>>>,
    recorder: Arc<Recorder>,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, node_id: &str, behavior: Behavior) -> Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(node_id.to_string(), behavior);
        self
    }

    /// Invocations of `node_id`.
    pub fn calls(&self, node_id: &str) -> usize {
        self.inputs(node_id).len()
    }

    /// Inputs `node_id` was invoked with, in order.
    pub fn inputs(&self, node_id: &str) -> Vec<Payload> {
        self.recorder
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == node_id)
            .map(|(_, input)| input.clone())
            .collect()
    }

    /// Node IDs in invocation order.
    pub fn order(&self) -> Vec<String> {
        self.recorder
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.recorder.calls.lock().unwrap().len()
    }

    /// Most processors observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.recorder.peak.load(Ordering::SeqCst)
    }
}

impl NodeFactory for RecordingFactory {
    fn create_node(&self, node: &Node, _deps: &FactoryDeps) -> Result<Arc<dyn NodeProcessor>> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&node.id)
            .cloned()
            .unwrap_or(Behavior::Echo);
        Ok(Arc::new(RecordingProcessor {
            behavior,
            recorder: self.recorder.clone(),
        }))
    }
}

struct RecordingProcessor {
    behavior: Behavior,
    recorder: Arc<Recorder>,
}

fn echo(node_id: &str, mut input: Payload) -> Payload {
    input.insert("from".into(), Value::String(node_id.to_string()));
    input.insert(node_id.to_string(), Value::Bool(true));
    input
}

impl NodeProcessor for RecordingProcessor {
    fn process(&self, ctx: NodeContext, input: Payload) -> BoxFuture<'_, Result<NodeOutcome>> {
        Box::pin(async move {
            let node_id = ctx.node_id().to_string();
            self.recorder
                .calls
                .lock()
                .unwrap()
                .push((node_id.clone(), input.clone()));
            let now = self.recorder.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.recorder.peak.fetch_max(now, Ordering::SeqCst);

            let outcome = match &self.behavior {
                Behavior::Echo => Ok(NodeOutcome::Completed(echo(&node_id, input))),
                Behavior::Delay(d) => {
                    tokio::time::sleep(*d).await;
                    Ok(NodeOutcome::Completed(echo(&node_id, input)))
                }
                Behavior::Output(out) => Ok(NodeOutcome::Completed(out.clone())),
                Behavior::Fail(msg) => Err(TrellisError::node_failed(node_id.clone(), msg.clone())),
                Behavior::Suspend => Ok(NodeOutcome::Suspended),
                Behavior::Processor(p) => p.process(ctx, input).await,
            };

            self.recorder.active.fetch_sub(1, Ordering::SeqCst);
            outcome
        })
    }

    fn router(&self) -> Option<&dyn trellis_core::traits::ConditionalRouter> {
        match &self.behavior {
            Behavior::Processor(p) => p.router(),
            _ => None,
        }
    }
}

// ── Mock middleware ─────────────────────────────────────────────

/// Counts hook invocations.
#[derive(Default)]
pub struct CountingMiddleware {
    pub before: AtomicUsize,
    pub after: AtomicUsize,
}

impl Middleware for CountingMiddleware {
    fn name(&self) -> &str {
        "counting"
    }

    fn before_node_execution<'a>(&'a self, _session: &'a Session, _node: &'a Node) -> BoxFuture<'a, Result<()>> {
        self.before.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn after_node_execution<'a>(
        &'a self,
        _session: &'a Session,
        _node: &'a Node,
        output: Payload,
    ) -> BoxFuture<'a, Result<Payload>> {
        self.after.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(output) })
    }
}

/// Rejects one node before it runs.
pub struct RejectingMiddleware {
    pub node_id: String,
}

impl RejectingMiddleware {
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
        }
    }
}

impl Middleware for RejectingMiddleware {
    fn name(&self) -> &str {
        "rejecting"
    }

    fn before_node_execution<'a>(&'a self, _session: &'a Session, node: &'a Node) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if node.id == self.node_id {
                Err(TrellisError::node_failed(node.id.clone(), "blocked by policy"))
            } else {
                Ok(())
            }
        })
    }
}

// ── Events ──────────────────────────────────────────────────────

/// Everything currently buffered on `rx`.
pub fn collect_events(rx: &mut EventReceiver) -> Vec<StreamEvent> {
    rx.drain()
}

/// Status transitions reported for `node_id`, in emission order.
pub fn status_trail(events: &[StreamEvent], node_id: &str) -> Vec<NodeStatus> {
    events
        .iter()
        .filter(|e| e.event_type == event_types::NODE_STATE_CHANGE && e.node_id.as_deref() == Some(node_id))
        .filter_map(|e| e.field("status").and_then(Value::as_str))
        .filter_map(|s| serde_json::from_value(Value::String(s.to_string())).ok())
        .collect()
}

/// Events of one type.
pub fn events_of<'a>(events: &'a [StreamEvent], event_type: &str) -> Vec<&'a StreamEvent> {
    events.iter().filter(|e| e.event_type == event_type).collect()
}

// ── Graph fixtures ──────────────────────────────────────────────

/// start → a → b → end
pub fn linear_graph() -> GraphDefinition {
    GraphDefinition::new("linear", "start")
        .with_node(Node::new("start", "start").with_next(["a"]))
        .with_node(Node::new("a", "agent").with_next(["b"]))
        .with_node(Node::new("b", "agent").with_next(["end"]))
        .with_node(Node::new("end", "end"))
}

/// start → fan(parallel) → {left, right} → join → end
pub fn diamond_graph() -> GraphDefinition {
    GraphDefinition::new("diamond", "start")
        .with_node(Node::new("start", "start").with_next(["fan"]))
        .with_node(Node::new("fan", "parallel").with_next(["left", "right"]))
        .with_node(Node::new("left", "agent").with_next(["join"]))
        .with_node(Node::new("right", "agent").with_next(["join"]))
        .with_node(Node::new("join", "agent").with_next(["end"]))
        .with_node(Node::new("end", "end"))
}

/// start → draft → review_loop(loop) ⇄ draft, exit → end
///
/// `draft` has two incoming edges; the loop-back one is excluded from its
/// join accounting.
pub fn loop_graph(max_rounds: u64) -> GraphDefinition {
    GraphDefinition::new("loop", "start")
        .with_node(Node::new("start", "start").with_next(["draft"]))
        .with_node(Node::new("draft", "agent").with_next(["review_loop"]))
        .with_node(
            Node::new("review_loop", "loop")
                .with_next(["draft", "end"])
                .with_property("max_rounds", max_rounds),
        )
        .with_node(Node::new("end", "end"))
}

/// start → review(human_review) → end
pub fn review_graph() -> GraphDefinition {
    GraphDefinition::new("review", "start")
        .with_node(Node::new("start", "start").with_next(["review"]))
        .with_node(Node::new("review", "human_review").with_next(["end"]))
        .with_node(Node::new("end", "end"))
}
