//! End Node
//!
//! Terminal node of a workflow (`node-end`) or of an iteration body
//! (`iteration-node-end`). Its result becomes the run's answer.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use workflow_engine::{
    EngineError, NodeContext, NodeDescription, NodeRunResult, Result, WorkflowNode,
};

use super::{render_streaming, resolve_declared, skipped};
use crate::BuiltinNode;

/// How an end node shapes its answer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutputMode {
    /// Declared inputs are returned as outputs
    #[default]
    Variable,
    /// A `{{name}}` template is rendered into `content`
    Prompt,
}

/// End Node
///
/// Resolves its declared inputs, consuming live streams of producers that
/// are still generating. A producer that was logically skipped resolves to
/// `null` instead of failing the run.
///
/// # Parameters
/// - `outputMode` - `variable` (default) or `prompt`
/// - `template` - Prompt-mode template
///
/// # Inputs (from variable pool)
/// - Every declared input
///
/// # Outputs (to variable pool)
/// - Variable mode: one output per declared input
/// - Prompt mode: `content` - The rendered template
#[derive(Debug, Clone)]
pub struct EndNode {
    /// Unique identifier for this node instance
    node_id: String,
    mode: OutputMode,
    template: String,
}

impl EndNode {
    /// Parameter selecting the output mode
    pub const PARAM_OUTPUT_MODE: &'static str = "outputMode";
    /// Parameter holding the prompt template
    pub const PARAM_TEMPLATE: &'static str = "template";
    /// Port ID for the rendered prompt
    pub const PORT_CONTENT: &'static str = "content";

    /// Create a new end node
    pub fn new(node_id: impl Into<String>, mode: OutputMode, template: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            mode,
            template: template.into(),
        }
    }

    /// Create an end node from its description
    pub fn from_description(description: &NodeDescription) -> Result<Self> {
        let mode = match description.param(Self::PARAM_OUTPUT_MODE) {
            None => OutputMode::default(),
            Some(value) => serde_json::from_value(value.clone()).map_err(|_| {
                EngineError::build(format!(
                    "End node: {} has unknown output mode {}",
                    description.id, value
                ))
            })?,
        };
        let template = description
            .param_str(Self::PARAM_TEMPLATE)
            .unwrap_or_default();
        Ok(Self::new(&description.id, mode, template))
    }

    /// Get the node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }
}

#[async_trait]
impl WorkflowNode for EndNode {
    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeRunResult> {
        if !ctx.await_output_dependencies().await {
            log::debug!("EndNode {}: skipped", self.node_id);
            return Ok(skipped(ctx));
        }

        // Iteration ends are framed by the engine like ordinary nodes
        let framed = ctx.kind().is_output();
        if framed {
            ctx.callbacks().on_node_start(ctx.node_id(), ctx.alias_name());
        }

        let result = match self.mode {
            OutputMode::Variable => {
                let values = resolve_declared(ctx).await?;
                NodeRunResult::succeeded(ctx.node_id(), ctx.alias_name())
                    .with_inputs(values.clone())
                    .with_outputs(values)
            }
            OutputMode::Prompt => {
                let (content, inputs) = render_streaming(ctx, &self.template).await?;
                NodeRunResult::succeeded(ctx.node_id(), ctx.alias_name())
                    .with_inputs(inputs)
                    .with_output(Self::PORT_CONTENT, content.clone().into())
                    .with_raw_output(content)
            }
        };

        if ctx.is_not_run() {
            log::debug!("EndNode {}: skipped while resolving", self.node_id);
            return Ok(skipped(ctx));
        }
        log::debug!(
            "EndNode {}: finished with {} outputs",
            self.node_id,
            result.outputs.len()
        );
        if framed {
            ctx.callbacks()
                .on_node_end(ctx.node_id(), ctx.alias_name(), Ok(&result));
        }
        Ok(result)
    }
}

fn create(description: &NodeDescription) -> Result<Arc<dyn WorkflowNode>> {
    Ok(Arc::new(EndNode::from_description(description)?))
}

inventory::submit!(BuiltinNode {
    node_type: "node-end",
    create,
});
inventory::submit!(BuiltinNode {
    node_type: "iteration-node-end",
    create,
});

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use workflow_engine::{
        EdgeDescription, EngineBuilder, NodeInput, RunRequest, VecEventSink, WorkflowDescription,
        WorkflowEvent,
    };

    use crate::testing::registry_with;

    fn workflow(end: NodeDescription) -> WorkflowDescription {
        let mut desc = WorkflowDescription::new("end-test");
        desc.nodes = vec![
            NodeDescription::new("node-start::1", "start"),
            NodeDescription::new("ifly-code::1", "code"),
            end,
        ];
        desc.edges = vec![
            EdgeDescription::new("node-start::1", "ifly-code::1"),
            EdgeDescription::new("ifly-code::1", "node-end::1"),
        ];
        desc
    }

    #[test]
    fn test_from_description() {
        let desc = NodeDescription::new("node-end::1", "end")
            .with_param("outputMode", json!("prompt"))
            .with_param("template", json!("Hi {{name}}"));
        let node = EndNode::from_description(&desc).unwrap();
        assert_eq!(node.mode(), OutputMode::Prompt);
        assert_eq!(node.node_id(), "node-end::1");

        let bad = NodeDescription::new("node-end::2", "end").with_param("outputMode", json!("xml"));
        assert!(EndNode::from_description(&bad).is_err());
    }

    #[tokio::test]
    async fn test_variable_mode_returns_inputs() {
        let end = NodeDescription::new("node-end::1", "end")
            .with_input(NodeInput::reference("answer", "ifly-code::1", "output"))
            .with_input(NodeInput::literal("tag", json!("fixed")));
        let engine = EngineBuilder::new(workflow(end), &registry_with(json!(42)))
            .build()
            .unwrap();

        let result = engine
            .run(RunRequest::default(), Arc::new(VecEventSink::new()))
            .await
            .unwrap();

        assert_eq!(result.outputs.get("answer"), Some(&json!(42)));
        assert_eq!(result.outputs.get("tag"), Some(&json!("fixed")));
    }

    #[tokio::test]
    async fn test_prompt_mode_streams_rendered_content() {
        let end = NodeDescription::new("node-end::1", "end")
            .with_input(NodeInput::reference("answer", "ifly-code::1", "output"))
            .with_param("outputMode", json!("prompt"))
            .with_param("template", json!("The answer is {{answer}}{{missing}}"));
        let engine = EngineBuilder::new(workflow(end), &registry_with(json!("yes")))
            .build()
            .unwrap();
        let sink = Arc::new(VecEventSink::new());

        let result = engine
            .run(RunRequest::default(), sink.clone())
            .await
            .unwrap();

        assert_eq!(
            result.outputs.get("content"),
            Some(&json!("The answer is yes{{missing}}"))
        );

        let events = sink.events();
        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                WorkflowEvent::NodeProcess { node_id, content, .. } if node_id == "node-end::1" => {
                    Some(content.as_str())
                }
                _ => None,
            })
            .collect();
        assert_eq!(streamed, "The answer is yes{{missing}}");

        let end_starts = events
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::NodeStarted { node_id, .. } if node_id == "node-end::1"))
            .count();
        assert_eq!(end_starts, 1);
    }
}
