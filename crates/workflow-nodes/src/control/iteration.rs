//! Iteration Node
//!
//! Runs a nested sub-graph once per element of an array input. The body
//! starts at an `iteration-node-start` node and ends at an
//! `iteration-node-end` node; both live in the same description as the
//! parent workflow but are only reachable through this node.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use workflow_engine::{
    EngineError, NodeContext, NodeDescription, NodeRunResult, Result, WorkflowNode,
};

use crate::BuiltinNode;

/// Iteration Node
///
/// Items are processed in order, one nested run at a time. Each nested
/// run sees the item as its start node's `item` output.
///
/// # Inputs (from variable pool)
/// - `input` (or the first declared input) - Array to iterate
///
/// # Outputs (to variable pool)
/// - `output` - One entry per item: the nested terminal's single output,
///   or all of its outputs as an object
#[derive(Debug, Clone)]
pub struct IterationNode {
    /// Unique identifier for this node instance
    node_id: String,
}

impl IterationNode {
    /// Port ID for the array input
    pub const PORT_INPUT: &'static str = "input";
    /// Key under which each item is exposed to the body
    pub const PORT_ITEM: &'static str = "item";
    /// Port ID for the collected results
    pub const PORT_OUTPUT: &'static str = "output";

    /// Create a new iteration node
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }

    /// Get the node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn input_name<'d>(&self, description: &'d NodeDescription) -> Option<&'d str> {
        description
            .input(Self::PORT_INPUT)
            .or_else(|| description.inputs.first())
            .map(|input| input.name.as_str())
    }
}

/// Value contributed by one nested run
fn collect_output(result: NodeRunResult) -> Value {
    let mut outputs = result.outputs;
    if outputs.len() == 1 {
        if let Some(key) = outputs.keys().next().cloned() {
            return outputs.remove(&key).unwrap_or(Value::Null);
        }
    }
    Value::Object(outputs)
}

#[async_trait]
impl WorkflowNode for IterationNode {
    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeRunResult> {
        let name = self.input_name(ctx.description()).ok_or_else(|| {
            EngineError::node_run(ctx.node_id(), "Iteration node declares no input")
        })?;
        let value = ctx.variable_pool().get_variable(ctx.node_id(), name).await?;
        let Value::Array(items) = value else {
            return Err(EngineError::node_run(
                ctx.node_id(),
                format!("Iteration input {} is not an array", name),
            ));
        };

        log::debug!(
            "IterationNode {}: running body for {} items",
            self.node_id,
            items.len()
        );

        let mut collected = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let mut inputs = workflow_engine::ValueMap::new();
            inputs.insert(Self::PORT_ITEM.to_string(), item.clone());
            let result = ctx.run_iteration(ctx.node_id(), inputs).await?;
            log::debug!("IterationNode {}: item {} done", self.node_id, index);
            collected.push(collect_output(result));
        }

        let mut inputs = workflow_engine::ValueMap::new();
        inputs.insert(name.to_string(), Value::Array(items));
        Ok(NodeRunResult::succeeded(ctx.node_id(), ctx.alias_name())
            .with_inputs(inputs)
            .with_output(Self::PORT_OUTPUT, Value::Array(collected)))
    }
}

fn create(description: &NodeDescription) -> Result<Arc<dyn WorkflowNode>> {
    Ok(Arc::new(IterationNode::new(&description.id)))
}

inventory::submit!(BuiltinNode {
    node_type: "iteration",
    create,
});
