use std::collections::HashMap;
use std::sync::Arc;

use trellis_core::error::{Result, TrellisError};
use trellis_core::graph::Node;
use trellis_core::traits::{FactoryDeps, NodeFactory, NodeProcessor};

use crate::builtin::{HumanReviewProcessor, LoopProcessor, PassthroughProcessor, WaitSignalProcessor};

/// Builds a processor for one node definition.
pub type NodeConstructor =
    Box<dyn Fn(&Node, &FactoryDeps) -> Result<Arc<dyn NodeProcessor>> + Send + Sync>;

/// Registry of node constructors, keyed by node type tag.
pub struct NodeRegistry {
    constructors: HashMap<String, NodeConstructor>,
    fallback: Option<NodeConstructor>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
            fallback: None,
        }
    }

    /// Register a constructor for a node type tag, replacing any existing one.
    pub fn register<F>(&mut self, node_type: impl Into<String>, constructor: F)
    where
        F: Fn(&Node, &FactoryDeps) -> Result<Arc<dyn NodeProcessor>> + Send + Sync + 'static,
    {
        self.constructors.insert(node_type.into(), Box::new(constructor));
    }

    /// Unregister a node type.
    pub fn unregister(&mut self, node_type: &str) -> bool {
        self.constructors.remove(node_type).is_some()
    }

    /// Constructor used for types with no registration.
    pub fn set_fallback<F>(&mut self, constructor: F)
    where
        F: Fn(&Node, &FactoryDeps) -> Result<Arc<dyn NodeProcessor>> + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(constructor));
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.constructors.contains_key(node_type)
    }

    /// List registered type tags, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.constructors.keys().map(|s| s.as_str()).collect();
        tags.sort_unstable();
        tags
    }

    /// Create a registry with the control-flow node types registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("start", |_, _| Ok(Arc::new(PassthroughProcessor)));
        registry.register("end", |_, _| Ok(Arc::new(PassthroughProcessor)));
        registry.register("loop", |node, _| Ok(Arc::new(LoopProcessor::from_node(node))));
        registry.register("human_review", |node, _| {
            Ok(Arc::new(HumanReviewProcessor::from_node(node)))
        });
        registry.register("wait", |_, _| Ok(Arc::new(WaitSignalProcessor)));
        registry
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeFactory for NodeRegistry {
    fn create_node(&self, node: &Node, deps: &FactoryDeps) -> Result<Arc<dyn NodeProcessor>> {
        let tag = node.node_type.as_str();
        match self.constructors.get(tag).or(self.fallback.as_ref()) {
            Some(constructor) => constructor(node, deps),
            None => Err(TrellisError::UnsupportedNodeType(tag.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::graph::GraphDefinition;
    use trellis_core::session::Session;
    use trellis_core::types::Payload;

    fn deps() -> FactoryDeps {
        let graph = GraphDefinition::new("wf", "start").with_node(Node::new("start", "start"));
        FactoryDeps {
            session: Arc::new(Session::new(Arc::new(graph), Payload::new())),
        }
    }

    #[test]
    fn builtins_registered() {
        let registry = NodeRegistry::with_builtins();
        assert_eq!(registry.list(), vec!["end", "human_review", "loop", "start", "wait"]);
        assert!(registry.create_node(&Node::new("s", "start"), &deps()).is_ok());
        assert!(registry.create_node(&Node::new("l", "loop"), &deps()).is_ok());
    }

    #[test]
    fn unknown_type_is_unsupported() {
        let registry = NodeRegistry::with_builtins();
        let err = registry
            .create_node(&Node::new("a", "agent"), &deps())
            .err()
            .unwrap();
        assert!(matches!(err, TrellisError::UnsupportedNodeType(t) if t == "agent"));
    }

    #[test]
    fn fallback_covers_unregistered() {
        let mut registry = NodeRegistry::new();
        registry.set_fallback(|_, _| Ok(Arc::new(PassthroughProcessor)));
        assert!(registry.create_node(&Node::new("a", "agent"), &deps()).is_ok());
    }

    #[test]
    fn unregister() {
        let mut registry = NodeRegistry::with_builtins();
        assert!(registry.unregister("wait"));
        assert!(!registry.contains("wait"));
        assert!(!registry.unregister("wait"));
    }

    #[test]
    fn loop_processor_has_router() {
        let registry = NodeRegistry::with_builtins();
        let p = registry.create_node(&Node::new("l", "loop"), &deps()).unwrap();
        assert!(p.router().is_some());
        let p = registry.create_node(&Node::new("e", "end"), &deps()).unwrap();
        assert!(p.router().is_none());
    }
}
