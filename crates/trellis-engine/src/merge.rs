//! Policies for combining parallel upstream outputs at a join.

use serde_json::Value;

use trellis_core::types::Payload;

/// Combines the outputs that reached a fan-in node into its single input.
///
/// `inputs` arrive in delivery order, not graph order.
pub trait MergeStrategy: Send + Sync + 'static {
    fn merge(&self, inputs: Vec<Payload>) -> Payload;
}

/// Keeps every branch under `branch_N` and passes through the first
/// occurrence of each field (first write wins).
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMergeStrategy;

impl MergeStrategy for DefaultMergeStrategy {
    fn merge(&self, inputs: Vec<Payload>) -> Payload {
        let mut merged = Payload::new();
        for (i, input) in inputs.into_iter().enumerate() {
            passthrough_first(&mut merged, &input, |_| false);
            merged.insert(format!("branch_{}", i), Value::Object(input));
        }
        merged
    }
}

/// Field aggregated by [`AggregatingMergeStrategy`].
pub const AGENT_OUTPUT_KEY: &str = "agent_output";
/// Field the aggregated text lands in.
pub const AGGREGATED_OUTPUTS_KEY: &str = "aggregated_outputs";

const AGGREGATE_SEPARATOR: &str = "\n\n---\n\n";

/// Like [`DefaultMergeStrategy`], but joins every branch's non-empty
/// `agent_output` text into `aggregated_outputs` instead of keeping only
/// the first.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregatingMergeStrategy;

impl MergeStrategy for AggregatingMergeStrategy {
    fn merge(&self, inputs: Vec<Payload>) -> Payload {
        let mut merged = Payload::new();
        let mut outputs: Vec<String> = Vec::new();

        for (i, input) in inputs.into_iter().enumerate() {
            if let Some(text) = input.get(AGENT_OUTPUT_KEY).and_then(Value::as_str) {
                if !text.is_empty() {
                    outputs.push(text.to_string());
                }
            }
            passthrough_first(&mut merged, &input, |k| k == AGENT_OUTPUT_KEY);
            merged.insert(format!("branch_{}", i), Value::Object(input));
        }

        if !outputs.is_empty() {
            merged.insert(
                AGGREGATED_OUTPUTS_KEY.to_string(),
                Value::String(outputs.join(AGGREGATE_SEPARATOR)),
            );
        }
        merged
    }
}

/// Copy fields of `input` not yet present in `merged`.
fn passthrough_first(merged: &mut Payload, input: &Payload, skip: impl Fn(&str) -> bool) {
    for (k, v) in input {
        if skip(k) {
            continue;
        }
        if !merged.contains_key(k) {
            merged.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(v: Value) -> Payload {
        match v {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn default_keeps_branches_and_first_write_wins() {
        let merged = DefaultMergeStrategy.merge(vec![
            payload(json!({"verdict": "approve", "score": 80})),
            payload(json!({"verdict": "reject", "notes": "needs tests"})),
        ]);

        assert_eq!(merged["verdict"], "approve");
        assert_eq!(merged["score"], 80);
        assert_eq!(merged["notes"], "needs tests");
        assert_eq!(merged["branch_0"]["verdict"], "approve");
        assert_eq!(merged["branch_1"]["verdict"], "reject");
    }

    #[test]
    fn default_single_input() {
        let merged = DefaultMergeStrategy.merge(vec![payload(json!({"a": 1}))]);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["branch_0"]["a"], 1);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn default_empty_input() {
        assert!(DefaultMergeStrategy.merge(vec![]).is_empty());
    }

    #[test]
    fn aggregating_joins_agent_outputs() {
        let merged = AggregatingMergeStrategy.merge(vec![
            payload(json!({"agent_output": "Pro: fast", "proposal": "p"})),
            payload(json!({"agent_output": "", "proposal": "q"})),
            payload(json!({"agent_output": "Con: risky"})),
        ]);

        assert_eq!(
            merged[AGGREGATED_OUTPUTS_KEY],
            "Pro: fast\n\n---\n\nCon: risky"
        );
        assert!(merged.get(AGENT_OUTPUT_KEY).is_none());
        assert_eq!(merged["proposal"], "p");
        assert_eq!(merged["branch_2"]["agent_output"], "Con: risky");
    }

    #[test]
    fn aggregating_without_outputs_has_no_aggregate() {
        let merged = AggregatingMergeStrategy.merge(vec![payload(json!({"x": 1}))]);
        assert!(merged.get(AGGREGATED_OUTPUTS_KEY).is_none());
    }
}
