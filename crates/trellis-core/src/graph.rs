use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::Payload;

/// Type tag of a workflow node.
///
/// Unknown tags survive a round trip as `Custom` so extension node types
/// can be resolved by an application-specific factory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeType {
    Start,
    End,
    Agent,
    Llm,
    Tool,
    Parallel,
    Sequence,
    Loop,
    Vote,
    FactCheck,
    HumanReview,
    MemoryRetrieval,
    ContextSynth,
    Custom(String),
}

impl NodeType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Agent => "agent",
            Self::Llm => "llm",
            Self::Tool => "tool",
            Self::Parallel => "parallel",
            Self::Sequence => "sequence",
            Self::Loop => "loop",
            Self::Vote => "vote",
            Self::FactCheck => "fact_check",
            Self::HumanReview => "human_review",
            Self::MemoryRetrieval => "memory_retrieval",
            Self::ContextSynth => "context_synth",
            Self::Custom(tag) => tag,
        }
    }
}

impl From<&str> for NodeType {
    fn from(tag: &str) -> Self {
        match tag {
            "start" => Self::Start,
            "end" => Self::End,
            "agent" => Self::Agent,
            "llm" => Self::Llm,
            "tool" => Self::Tool,
            "parallel" => Self::Parallel,
            "sequence" => Self::Sequence,
            "loop" => Self::Loop,
            "vote" => Self::Vote,
            "fact_check" => Self::FactCheck,
            "human_review" => Self::HumanReview,
            "memory_retrieval" => Self::MemoryRetrieval,
            "context_synth" => Self::ContextSynth,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for NodeType {
    fn from(tag: String) -> Self {
        Self::from(tag.as_str())
    }
}

impl From<NodeType> for String {
    fn from(t: NodeType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single step in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "node_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub name: String,
    /// Downstream node IDs. For loop nodes index 0 is the loop-back edge
    /// and index 1 the exit edge.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_ids: Vec<String>,
    #[serde(default)]
    pub properties: Payload,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<NodeType>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            node_type: node_type.into(),
            next_ids: vec![],
            properties: Payload::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Append downstream edges.
    pub fn with_next<I, S>(mut self, next: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next_ids.extend(next.into_iter().map(Into::into));
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn is_parallel(&self) -> bool {
        self.node_type == NodeType::Parallel
    }

    pub fn is_loop(&self) -> bool {
        self.node_type == NodeType::Loop
    }

    /// The loop-back target of a loop node.
    pub fn loop_back_target(&self) -> Option<&str> {
        if self.is_loop() {
            self.next_ids.first().map(String::as_str)
        } else {
            None
        }
    }

    pub fn property_u64(&self, key: &str) -> Option<u64> {
        self.properties.get(key).and_then(|v| v.as_u64())
    }

    pub fn property_bool(&self, key: &str) -> Option<bool> {
        self.properties.get(key).and_then(|v| v.as_bool())
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    /// A string-list property; non-string entries are ignored.
    pub fn property_strings(&self, key: &str) -> Vec<String> {
        self.properties
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Static description of a workflow DAG. Immutable once execution starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(rename = "workflow_uuid", default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub start_node_id: String,
    #[serde(default)]
    pub nodes: HashMap<String, Node>,
}

impl GraphDefinition {
    pub fn new(id: impl Into<String>, start_node_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            start_node_id: start_node_id.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a node keyed by its own ID.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Parse a graph from its JSON form.
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Static in-degree of every node.
    ///
    /// A loop node's first edge is the loop-back edge and is not counted:
    /// it is delivered outside the join accounting.
    pub fn in_degrees(&self) -> HashMap<String, usize> {
        let mut in_degree = HashMap::new();
        for node in self.nodes.values() {
            for (i, next_id) in node.next_ids.iter().enumerate() {
                if node.is_loop() && i == 0 {
                    continue;
                }
                *in_degree.entry(next_id.clone()).or_insert(0) += 1;
            }
        }
        in_degree
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_round_trips_known_and_custom_tags() {
        assert_eq!(NodeType::from("human_review"), NodeType::HumanReview);
        assert_eq!(NodeType::from("wait"), NodeType::Custom("wait".into()));
        assert_eq!(String::from(NodeType::FactCheck), "fact_check");
    }

    #[test]
    fn parse_graph_json() {
        let json = r#"{
            "workflow_uuid": "wf-1",
            "name": "Review",
            "start_node_id": "start",
            "nodes": {
                "start": {"node_id": "start", "type": "start", "next_ids": ["end"], "properties": {}},
                "end": {"node_id": "end", "type": "end"}
            }
        }"#;
        let graph = GraphDefinition::from_json(json).unwrap();
        assert_eq!(graph.id, "wf-1");
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.node("start").unwrap().next_ids, vec!["end"]);
        assert_eq!(graph.node("end").unwrap().node_type, NodeType::End);
    }

    #[test]
    fn in_degree_skips_loop_back_edge() {
        let graph = GraphDefinition::new("g", "a")
            .with_node(Node::new("a", "agent").with_next(["l"]))
            .with_node(Node::new("l", "loop").with_next(["a", "end"]))
            .with_node(Node::new("end", "end"));
        let deg = graph.in_degrees();
        assert_eq!(deg.get("a"), None);
        assert_eq!(deg["l"], 1);
        assert_eq!(deg["end"], 1);
    }

    #[test]
    fn property_helpers() {
        let node = Node::new("l", NodeType::Loop)
            .with_property("max_rounds", 4)
            .with_property("passthrough_keys", serde_json::json!(["topic", 3]));
        assert_eq!(node.property_u64("max_rounds"), Some(4));
        assert_eq!(node.property_strings("passthrough_keys"), vec!["topic"]);
        assert_eq!(node.loop_back_target(), None);
    }
}
