//! Message Node
//!
//! Emits an intermediate message to the caller while the workflow keeps
//! running. Typically used to surface a model's answer before the end node.

use std::sync::Arc;

use async_trait::async_trait;
use workflow_engine::{NodeContext, NodeDescription, NodeRunResult, Result, WorkflowNode};

use super::{render_streaming, skipped};
use crate::BuiltinNode;

/// Message Node
///
/// Waits until every earlier output node on its chains has completed or
/// been skipped, then renders its template. Fragments of a streaming
/// producer are forwarded through `on_node_process` as they arrive.
///
/// # Parameters
/// - `template` - Message template with `{{name}}` placeholders
///
/// # Inputs (from variable pool)
/// - Every input named by a placeholder
///
/// # Outputs (to variable pool)
/// - `content` - The rendered message
#[derive(Debug, Clone)]
pub struct MessageNode {
    /// Unique identifier for this node instance
    node_id: String,
    template: String,
}

impl MessageNode {
    /// Parameter holding the message template
    pub const PARAM_TEMPLATE: &'static str = "template";
    /// Port ID for the rendered message
    pub const PORT_CONTENT: &'static str = "content";

    /// Create a new message node
    pub fn new(node_id: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            template: template.into(),
        }
    }

    /// Get the node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn template(&self) -> &str {
        &self.template
    }
}

#[async_trait]
impl WorkflowNode for MessageNode {
    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeRunResult> {
        if !ctx.await_output_dependencies().await {
            log::debug!("MessageNode {}: skipped", self.node_id);
            return Ok(skipped(ctx));
        }

        ctx.callbacks().on_node_start(ctx.node_id(), ctx.alias_name());
        let (content, inputs) = render_streaming(ctx, &self.template).await?;
        if ctx.is_not_run() {
            log::debug!("MessageNode {}: skipped while rendering", self.node_id);
            return Ok(skipped(ctx));
        }
        log::debug!(
            "MessageNode {}: rendered {} bytes",
            self.node_id,
            content.len()
        );

        let result = NodeRunResult::succeeded(ctx.node_id(), ctx.alias_name())
            .with_inputs(inputs)
            .with_output(Self::PORT_CONTENT, content.clone().into())
            .with_raw_output(content);
        ctx.callbacks()
            .on_node_end(ctx.node_id(), ctx.alias_name(), Ok(&result));
        Ok(result)
    }
}

fn create(description: &NodeDescription) -> Result<Arc<dyn WorkflowNode>> {
    let template = description
        .param_str(MessageNode::PARAM_TEMPLATE)
        .unwrap_or_default();
    Ok(Arc::new(MessageNode::new(&description.id, template)))
}

inventory::submit!(BuiltinNode {
    node_type: "message",
    create,
});
