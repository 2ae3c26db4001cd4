//! Start Node
//!
//! Entry point of a workflow (`node-start`) or of an iteration body
//! (`iteration-node-start`).

use std::sync::Arc;

use async_trait::async_trait;
use workflow_engine::{NodeContext, NodeDescription, NodeRunResult, Result, WorkflowNode};

use crate::BuiltinNode;

/// Start Node
///
/// Exposes the run inputs as its outputs. Inside an iteration the run
/// inputs are the current item, so `item` is available downstream.
///
/// # Outputs (to variable pool)
/// - One output per run input
#[derive(Debug, Clone)]
pub struct StartNode {
    /// Unique identifier for this node instance
    node_id: String,
}

impl StartNode {
    /// Create a new start node
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }

    /// Get the node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[async_trait]
impl WorkflowNode for StartNode {
    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeRunResult> {
        let inputs = ctx.run_inputs().clone();
        log::debug!("StartNode {}: {} run inputs", self.node_id, inputs.len());
        Ok(NodeRunResult::succeeded(ctx.node_id(), ctx.alias_name())
            .with_inputs(inputs.clone())
            .with_outputs(inputs))
    }
}

fn create(description: &NodeDescription) -> Result<Arc<dyn WorkflowNode>> {
    Ok(Arc::new(StartNode::new(&description.id)))
}

inventory::submit!(BuiltinNode {
    node_type: "node-start",
    create,
});
inventory::submit!(BuiltinNode {
    node_type: "iteration-node-start",
    create,
});

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use workflow_engine::{
        EdgeDescription, EngineBuilder, NodeInput, NullEventSink, RunRequest, ValueMap,
        WorkflowDescription,
    };

    use crate::builtin_registry;

    #[test]
    fn test_node_id() {
        assert_eq!(StartNode::new("node-start::1").node_id(), "node-start::1");
    }

    #[tokio::test]
    async fn test_run_inputs_flow_to_end() {
        let mut desc = WorkflowDescription::new("start-test");
        desc.nodes = vec![
            NodeDescription::new("node-start::1", "start"),
            NodeDescription::new("node-end::1", "end")
                .with_input(NodeInput::reference("echo", "node-start::1", "query")),
        ];
        desc.edges = vec![EdgeDescription::new("node-start::1", "node-end::1")];
        let engine = EngineBuilder::new(desc, &builtin_registry()).build().unwrap();

        let mut inputs = ValueMap::new();
        inputs.insert("query".into(), json!("hello"));
        let result = engine
            .run(RunRequest::new(inputs), Arc::new(NullEventSink))
            .await
            .unwrap();

        assert_eq!(result.outputs.get("echo"), Some(&json!("hello")));
    }
}
