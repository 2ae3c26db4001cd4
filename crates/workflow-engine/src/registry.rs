//! Node type registry
//!
//! Maps a node id's type tag (`spark-llm`, `if-else`, ...) to a factory that
//! builds the node's executable instance from its description. The builder
//! rejects any tag with no registered factory.
//!
//! # Usage
//!
//! ```ignore
//! use workflow_engine::{NodeRegistry, EngineBuilder};
//!
//! let mut registry = NodeRegistry::new();
//! registry.register_fn("ifly-code", |_desc| Ok(Arc::new(MyCodeNode)));
//! registry.merge(plugin_registry);
//!
//! let engine = EngineBuilder::new(description, &registry).build()?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::node::WorkflowNode;
use crate::types::NodeDescription;

/// Builds node instances of one type
pub trait NodeFactory: Send + Sync {
    fn create(&self, description: &NodeDescription) -> Result<Arc<dyn WorkflowNode>>;
}

/// Factory backed by a closure
struct FnNodeFactory<F> {
    create: F,
}

impl<F> NodeFactory for FnNodeFactory<F>
where
    F: Fn(&NodeDescription) -> Result<Arc<dyn WorkflowNode>> + Send + Sync,
{
    fn create(&self, description: &NodeDescription) -> Result<Arc<dyn WorkflowNode>> {
        (self.create)(description)
    }
}

/// Registry of node types and their factories
///
/// Registries compose by merging, so built-in control nodes and plugin
/// nodes can be registered separately:
///
/// ```ignore
/// let mut registry = NodeRegistry::new();
/// workflow_nodes::register_builtins(&mut registry);
/// registry.merge(plugin_registry);
/// ```
#[derive(Default)]
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a type tag, replacing any previous one
    pub fn register(&mut self, node_type: impl Into<String>, factory: Arc<dyn NodeFactory>) {
        let node_type = node_type.into();
        if self.factories.insert(node_type.clone(), factory).is_some() {
            log::debug!("Replaced factory for node type '{}'", node_type);
        }
    }

    /// Register a closure as the factory for a type tag
    pub fn register_fn<F>(&mut self, node_type: impl Into<String>, create: F)
    where
        F: Fn(&NodeDescription) -> Result<Arc<dyn WorkflowNode>> + Send + Sync + 'static,
    {
        self.register(node_type, Arc::new(FnNodeFactory { create }));
    }

    pub fn has_node_type(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Registered type tags, sorted
    pub fn node_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Build the instance for a node description
    pub fn create(&self, description: &NodeDescription) -> Result<Arc<dyn WorkflowNode>> {
        let kind = description.kind();
        let factory = self
            .factories
            .get(kind.as_tag())
            .ok_or_else(|| EngineError::UnsupportedNodeType(kind.as_tag().to_string()))?;
        factory.create(description)
    }

    /// Merge another registry into this one
    ///
    /// Entries from `other` override entries with the same type tag.
    pub fn merge(&mut self, other: NodeRegistry) {
        self.factories.extend(other.factories);
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NodeContext;
    use crate::types::NodeRunResult;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl WorkflowNode for Echo {
        async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeRunResult> {
            Ok(NodeRunResult::succeeded(ctx.node_id(), ctx.alias_name()))
        }
    }

    #[test]
    fn test_register_and_create() {
        let mut registry = NodeRegistry::new();
        registry.register_fn("ifly-code", |_| Ok(Arc::new(Echo) as Arc<dyn WorkflowNode>));

        assert!(registry.has_node_type("ifly-code"));
        assert!(!registry.has_node_type("spark-llm"));
        assert!(registry
            .create(&NodeDescription::new("ifly-code::1", "code"))
            .is_ok());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let registry = NodeRegistry::new();
        let err = match registry.create(&NodeDescription::new("teleport::1", "x")) {
            Err(err) => err,
            Ok(_) => panic!("unknown type must be rejected"),
        };
        assert!(matches!(err, EngineError::UnsupportedNodeType(ref t) if t == "teleport"));
    }

    #[test]
    fn test_merge_overrides_and_sorts() {
        let mut base = NodeRegistry::new();
        base.register_fn("node-start", |_| Ok(Arc::new(Echo) as Arc<dyn WorkflowNode>));
        base.register_fn("ifly-code", |_| Ok(Arc::new(Echo) as Arc<dyn WorkflowNode>));

        let mut plugins = NodeRegistry::new();
        plugins.register_fn("ifly-code", |_| {
            Err(EngineError::build("plugin variant"))
        });
        plugins.register_fn("agent", |_| Ok(Arc::new(Echo) as Arc<dyn WorkflowNode>));

        base.merge(plugins);
        assert_eq!(base.node_types(), vec!["agent", "ifly-code", "node-start"]);
        assert!(base
            .create(&NodeDescription::new("ifly-code::1", "code"))
            .is_err());
    }
}
