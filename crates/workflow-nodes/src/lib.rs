//! Workflow Nodes
//!
//! Built-in control nodes for the workflow engine. Each node is an atomic
//! building block that can be composed into workflows; model-backed nodes
//! (LLM, agent, knowledge, code) are registered by the embedding service.
//!
//! # Categories
//!
//! - **Input**: run inputs and interactive questions
//! - **Output**: message and terminal nodes
//! - **Control**: branching and iteration
//!
//! Every built-in submits a [`BuiltinNode`] at link time and
//! [`register_builtins`] collects them into a [`NodeRegistry`].

use std::sync::Arc;

use workflow_engine::{NodeDescription, NodeRegistry, Result, WorkflowNode};

pub mod control;
pub mod input;
pub mod output;
pub mod template;

// Re-export all nodes for convenience
pub use control::*;
pub use input::*;
pub use output::*;

/// Link-time descriptor of a built-in node type
pub struct BuiltinNode {
    /// Type tag, the part of a node id before `::`
    pub node_type: &'static str,
    pub create: fn(&NodeDescription) -> Result<Arc<dyn WorkflowNode>>,
}

inventory::collect!(BuiltinNode);

/// Register every built-in node type
pub fn register_builtins(registry: &mut NodeRegistry) {
    for builtin in inventory::iter::<BuiltinNode> {
        let create = builtin.create;
        registry.register_fn(builtin.node_type, move |description| create(description));
    }
    log::debug!("Registered {} built-in node types", registry.len());
}

/// Registry holding only the built-in node types
pub fn builtin_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_builtins(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_collects_all_builtins() {
        let registry = builtin_registry();
        assert_eq!(registry.len(), 8, "Expected 8 built-in node types");

        for tag in [
            "node-start",
            "iteration-node-start",
            "node-end",
            "iteration-node-end",
            "message",
            "if-else",
            "question-answer",
            "iteration",
        ] {
            assert!(registry.has_node_type(tag), "missing {}", tag);
        }
    }
}
