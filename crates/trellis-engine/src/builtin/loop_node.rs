use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use trellis_core::error::Result;
use trellis_core::graph::Node;
use trellis_core::traits::{ConditionalRouter, NodeContext, NodeOutcome, NodeProcessor};
use trellis_core::types::Payload;

const DEFAULT_MAX_ROUNDS: u64 = 3;
/// Score drop between consecutive rounds flagged as a regression.
const REGRESSION_DELTA: f64 = 10.0;
/// Most recent scores kept in the session context per loop node.
const SCORE_HISTORY_LIMIT: usize = 50;

/// Decides whether a cycle runs another round.
///
/// A loop node's first edge is the loop-back edge and its second the exit
/// edge. The round counter and score history live in the session context
/// under keys scoped to the node, so they survive across iterations.
#[derive(Debug, Clone)]
pub struct LoopProcessor {
    pub max_rounds: u64,
    /// Exit once the score reaches this value (0 = off).
    pub exit_on_score: f64,
    /// Input keys copied onto the output for the next round.
    pub passthrough_keys: Vec<String>,
}

impl Default for LoopProcessor {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            exit_on_score: 0.0,
            passthrough_keys: Vec::new(),
        }
    }
}

impl LoopProcessor {
    pub fn from_node(node: &Node) -> Self {
        Self {
            max_rounds: node
                .property_u64("max_rounds")
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_ROUNDS),
            exit_on_score: node
                .properties
                .get("exit_on_score")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            passthrough_keys: node.property_strings("passthrough_keys"),
        }
    }
}

/// The round's score: `score`, else `structured_score.weighted_score`, else 0.
fn score_of(input: &Payload) -> f64 {
    input
        .get("score")
        .and_then(Value::as_f64)
        .or_else(|| {
            input
                .get("structured_score")
                .and_then(|s| s.get("weighted_score"))
                .and_then(Value::as_f64)
        })
        .unwrap_or(0.0)
}

impl NodeProcessor for LoopProcessor {
    fn process(&self, ctx: NodeContext, input: Payload) -> BoxFuture<'_, Result<NodeOutcome>> {
        Box::pin(async move {
            let round_key = format!("loop:{}:round", ctx.node_id());
            let history_key = format!("loop:{}:score_history", ctx.node_id());
            let session = &ctx.session;

            let round = session
                .context_value(&round_key)
                .await
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
                + 1;
            session.set_context(round_key, json!(round)).await;

            let score = score_of(&input);
            let mut history: Vec<f64> = session
                .context_value(&history_key)
                .await
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            history.push(score);
            if history.len() > SCORE_HISTORY_LIMIT {
                history.drain(..history.len() - SCORE_HISTORY_LIMIT);
            }
            let regression = match history.as_slice() {
                [.., prev, last] => last - prev < -REGRESSION_DELTA,
                _ => false,
            };
            session.set_context(history_key, json!(history)).await;

            let mut should_exit = false;
            let mut exit_reason = "";
            if round >= self.max_rounds {
                should_exit = true;
                exit_reason = "max_rounds_reached";
            }
            if regression {
                exit_reason = "regression_detected";
            }
            if self.exit_on_score > 0.0 && score >= self.exit_on_score {
                should_exit = true;
                exit_reason = "score_threshold_reached";
            }

            if should_exit {
                info!(node_id = %ctx.node_id(), round, score, reason = exit_reason, "Loop exiting");
            } else {
                debug!(node_id = %ctx.node_id(), round, score, "Loop continuing");
            }

            let mut output = Payload::new();
            output.insert("should_exit".into(), Value::Bool(should_exit));
            output.insert("exit_reason".into(), Value::String(exit_reason.to_string()));
            output.insert("current_round".into(), json!(round));
            output.insert("regression_detected".into(), Value::Bool(regression));
            output.insert(
                "timestamp".into(),
                Value::String(chrono::Utc::now().to_rfc3339()),
            );
            for key in &self.passthrough_keys {
                if let Some(v) = input.get(key) {
                    output.insert(key.clone(), v.clone());
                }
            }
            Ok(NodeOutcome::Completed(output))
        })
    }

    fn router(&self) -> Option<&dyn ConditionalRouter> {
        Some(self)
    }
}

impl ConditionalRouter for LoopProcessor {
    fn next_nodes<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
        output: &'a Payload,
        default_next: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            if default_next.len() < 2 {
                return Ok(default_next.to_vec());
            }
            let should_exit = output
                .get("should_exit")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let next = if should_exit {
                &default_next[1]
            } else {
                &default_next[0]
            };
            Ok(vec![next.clone()])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use trellis_core::event::{BackpressurePolicy, EventStream};
    use trellis_core::graph::GraphDefinition;
    use trellis_core::session::Session;

    fn loop_node(props: Value) -> Node {
        let mut node = Node::new("review_loop", "loop").with_next(["draft", "publish"]);
        if let Value::Object(map) = props {
            node.properties = map;
        }
        node
    }

    fn ctx_for(node: &Node) -> NodeContext {
        let graph = GraphDefinition::new("wf", node.id.clone()).with_node(node.clone());
        let (events, _rx) = EventStream::new(16, BackpressurePolicy::DropNewest);
        NodeContext {
            session: Arc::new(Session::new(Arc::new(graph), Payload::new())),
            node: node.clone(),
            cancel: CancellationToken::new(),
            events,
        }
    }

    fn payload(v: Value) -> Payload {
        match v {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    async fn run(p: &LoopProcessor, ctx: &NodeContext, input: Value) -> Payload {
        match p.process(ctx.clone(), payload(input)).await.unwrap() {
            NodeOutcome::Completed(out) => out,
            NodeOutcome::Suspended => panic!("loop never suspends"),
        }
    }

    #[test]
    fn from_node_reads_properties() {
        let node = loop_node(json!({"max_rounds": 5, "exit_on_score": 90, "passthrough_keys": ["draft"]}));
        let p = LoopProcessor::from_node(&node);
        assert_eq!(p.max_rounds, 5);
        assert_eq!(p.exit_on_score, 90.0);
        assert_eq!(p.passthrough_keys, vec!["draft".to_string()]);

        let p = LoopProcessor::from_node(&loop_node(json!({})));
        assert_eq!(p.max_rounds, DEFAULT_MAX_ROUNDS);
        assert_eq!(p.exit_on_score, 0.0);
    }

    #[tokio::test]
    async fn exits_after_max_rounds() {
        let node = loop_node(json!({"max_rounds": 2}));
        let ctx = ctx_for(&node);
        let p = LoopProcessor::from_node(&node);

        let first = run(&p, &ctx, json!({})).await;
        assert_eq!(first["should_exit"], false);
        assert_eq!(first["current_round"], 1);

        let second = run(&p, &ctx, json!({})).await;
        assert_eq!(second["should_exit"], true);
        assert_eq!(second["exit_reason"], "max_rounds_reached");
        assert_eq!(second["current_round"], 2);
    }

    #[tokio::test]
    async fn exits_on_score_threshold() {
        let node = loop_node(json!({"max_rounds": 10, "exit_on_score": 85}));
        let ctx = ctx_for(&node);
        let p = LoopProcessor::from_node(&node);

        let out = run(&p, &ctx, json!({"structured_score": {"weighted_score": 91.5}})).await;
        assert_eq!(out["should_exit"], true);
        assert_eq!(out["exit_reason"], "score_threshold_reached");
    }

    #[tokio::test]
    async fn flags_regression() {
        let node = loop_node(json!({"max_rounds": 10}));
        let ctx = ctx_for(&node);
        let p = LoopProcessor::from_node(&node);

        run(&p, &ctx, json!({"score": 80})).await;
        let out = run(&p, &ctx, json!({"score": 60})).await;
        assert_eq!(out["regression_detected"], true);
        assert_eq!(out["exit_reason"], "regression_detected");
        assert_eq!(out["should_exit"], false);

        let history = ctx.session.context_value("loop:review_loop:score_history").await.unwrap();
        assert_eq!(history, json!([80.0, 60.0]));
    }

    #[tokio::test]
    async fn score_history_keeps_recent_rounds_only() {
        let node = loop_node(json!({"max_rounds": 1000}));
        let ctx = ctx_for(&node);
        let p = LoopProcessor::from_node(&node);

        for score in 0..(SCORE_HISTORY_LIMIT + 5) {
            run(&p, &ctx, json!({"score": score})).await;
        }

        let history: Vec<f64> = serde_json::from_value(
            ctx.session.context_value("loop:review_loop:score_history").await.unwrap(),
        )
        .unwrap();
        assert_eq!(history.len(), SCORE_HISTORY_LIMIT);
        assert_eq!(history[0], 5.0);
        assert_eq!(history.last().copied(), Some((SCORE_HISTORY_LIMIT + 4) as f64));
    }

    #[tokio::test]
    async fn passthrough_keys_are_copied() {
        let node = loop_node(json!({"passthrough_keys": ["draft"]}));
        let ctx = ctx_for(&node);
        let p = LoopProcessor::from_node(&node);

        let out = run(&p, &ctx, json!({"draft": "v1", "noise": true})).await;
        assert_eq!(out["draft"], "v1");
        assert!(out.get("noise").is_none());
    }

    #[tokio::test]
    async fn router_picks_edge() {
        let p = LoopProcessor::default();
        let cancel = CancellationToken::new();
        let edges = vec!["draft".to_string(), "publish".to_string()];

        let stay = payload(json!({"should_exit": false}));
        assert_eq!(p.next_nodes(&cancel, &stay, &edges).await.unwrap(), vec!["draft"]);

        let leave = payload(json!({"should_exit": true}));
        assert_eq!(p.next_nodes(&cancel, &leave, &edges).await.unwrap(), vec!["publish"]);

        let single = vec!["draft".to_string()];
        assert_eq!(p.next_nodes(&cancel, &leave, &single).await.unwrap(), single);
    }
}
