//! Output nodes
//!
//! Message and end nodes frame what the caller sees. They fire their own
//! start/end callbacks, wait for earlier output nodes on their chains and
//! forward a producer's stream fragment by fragment while rendering.

mod end;
mod message;

pub use end::{EndNode, OutputMode};
pub use message::MessageNode;

use serde_json::Value;
use workflow_engine::{NodeContext, NodeExecutionStatus, NodeRunResult, Result, ValueMap};

use crate::template::{self, Segment};

/// Result of an output node that was skipped while waiting its turn
pub(crate) fn skipped(ctx: &NodeContext<'_>) -> NodeRunResult {
    let mut result = NodeRunResult::succeeded(ctx.node_id(), ctx.alias_name());
    result.status = NodeExecutionStatus::Cancelled;
    result
}

/// Render a template, streaming every piece through `on_node_process`
///
/// Returns the full rendered text and the resolved inputs. Placeholders
/// that name no declared input are emitted verbatim.
pub(crate) async fn render_streaming(
    ctx: &NodeContext<'_>,
    template: &str,
) -> Result<(String, ValueMap)> {
    let callbacks = ctx.callbacks();
    let (node_id, alias) = (ctx.node_id(), ctx.alias_name());
    let mut content = String::new();
    let mut inputs = ValueMap::new();

    for segment in template::parse(template) {
        let name = match segment {
            Segment::Var(name) if ctx.description().input(&name).is_some() => name,
            other => {
                let text = other.raw();
                callbacks.on_node_process(node_id, alias, &text, false);
                content.push_str(&text);
                continue;
            }
        };

        let mut streamed = String::new();
        let value = ctx
            .resolve_streamed_input(&name, |fragment| {
                callbacks.on_node_process(node_id, alias, fragment, false);
                streamed.push_str(fragment);
            })
            .await?;

        if streamed.is_empty() {
            let text = template::value_text(&value);
            if !text.is_empty() {
                callbacks.on_node_process(node_id, alias, &text, false);
            }
            content.push_str(&text);
        } else {
            content.push_str(&streamed);
        }
        inputs.insert(name, value);
    }

    callbacks.on_node_process(node_id, alias, "", true);
    Ok((content, inputs))
}

/// Resolve every declared input without forwarding fragments
pub(crate) async fn resolve_declared(ctx: &NodeContext<'_>) -> Result<ValueMap> {
    let mut values = ValueMap::new();
    for input in &ctx.description().inputs {
        let value: Value = ctx.resolve_streamed_input(&input.name, |_| {}).await?;
        values.insert(input.name.clone(), value);
    }
    Ok(values)
}
