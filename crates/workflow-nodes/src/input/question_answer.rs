//! Question-Answer Node
//!
//! Human-in-the-loop node: asks the caller a question and pauses its branch
//! until an answer is submitted to the run's variable pool. Only one
//! question is open at a time across a run and its iterations.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use workflow_engine::constants::{params, DEFAULT_INTENT_NAME, OPTION_ANSWER_TYPE};
use workflow_engine::{
    EngineError, NodeContext, NodeDescription, NodeRunResult, Result, ValueMap, WorkflowNode,
};

use crate::template::{self, Segment};
use crate::BuiltinNode;

/// One selectable answer of an option question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerOption {
    /// Branch label of the option
    pub id: String,
    /// `default` marks the fallback for unmatched answers
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content: String,
}

/// Question-Answer Node
///
/// Fires `on_node_interrupt` with its question and waits for an answer.
/// In `option` mode the answer is matched against the options by id or
/// content and the matching option id becomes the branch label.
///
/// # Parameters
/// - `question` - Question template with `{{name}}` placeholders
/// - `answerType` - `option` or `direct` (default)
/// - `options` - List of [`AnswerOption`] for option mode
///
/// # Outputs (to variable pool)
/// - `query` - The rendered question
/// - `content` - The answer text
/// - `id` - The chosen option id (option mode only)
#[derive(Debug, Clone)]
pub struct QuestionAnswerNode {
    /// Unique identifier for this node instance
    node_id: String,
    question: String,
    options: Option<Vec<AnswerOption>>,
}

impl QuestionAnswerNode {
    /// Parameter holding the question template
    pub const PARAM_QUESTION: &'static str = "question";
    /// Parameter holding the answer options
    pub const PARAM_OPTIONS: &'static str = "options";
    /// Port ID for the rendered question
    pub const PORT_QUERY: &'static str = "query";
    /// Port ID for the answer text
    pub const PORT_CONTENT: &'static str = "content";
    /// Port ID for the chosen option
    pub const PORT_ID: &'static str = "id";

    /// Create a node answering freely
    pub fn direct(node_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            question: question.into(),
            options: None,
        }
    }

    /// Create a node whose answer selects one of `options`
    pub fn with_options(
        node_id: impl Into<String>,
        question: impl Into<String>,
        options: Vec<AnswerOption>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            question: question.into(),
            options: Some(options),
        }
    }

    /// Create a question node from its description
    pub fn from_description(description: &NodeDescription) -> Result<Self> {
        let question = description
            .param_str(Self::PARAM_QUESTION)
            .unwrap_or_default();
        if description.param_str(params::ANSWER_TYPE) != Some(OPTION_ANSWER_TYPE) {
            return Ok(Self::direct(&description.id, question));
        }

        let options: Vec<AnswerOption> = description
            .param(Self::PARAM_OPTIONS)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(|e| {
                EngineError::build(format!(
                    "Question node: {} has malformed options: {}",
                    description.id, e
                ))
            })?
            .unwrap_or_default();
        if options.is_empty() {
            return Err(EngineError::build(format!(
                "Question node: {} declares no options",
                description.id
            )));
        }
        Ok(Self::with_options(&description.id, question, options))
    }

    /// Get the node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Option matching an answer, falling back to the `default` option
    pub fn match_option(&self, answer: &str) -> Option<&AnswerOption> {
        let options = self.options.as_deref()?;
        let answer = answer.trim();
        options
            .iter()
            .find(|o| o.id == answer || o.content.trim() == answer)
            .or_else(|| options.iter().find(|o| o.name == DEFAULT_INTENT_NAME))
    }

    async fn render_question(&self, ctx: &NodeContext<'_>) -> Result<(String, ValueMap)> {
        let mut question = String::new();
        let mut inputs = ValueMap::new();
        for segment in template::parse(&self.question) {
            match segment {
                Segment::Var(name) if ctx.description().input(&name).is_some() => {
                    let value = ctx.variable_pool().get_variable(ctx.node_id(), &name).await?;
                    question.push_str(&template::value_text(&value));
                    inputs.insert(name, value);
                }
                other => question.push_str(&other.raw()),
            }
        }
        Ok((question, inputs))
    }
}

/// Text of a submitted answer; objects may carry `content` or `id`
fn answer_text(answer: &Value) -> String {
    match answer {
        Value::Object(map) => map
            .get("content")
            .or_else(|| map.get("id"))
            .map(template::value_text)
            .unwrap_or_default(),
        other => template::value_text(other),
    }
}

#[async_trait]
impl WorkflowNode for QuestionAnswerNode {
    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeRunResult> {
        let (question, inputs) = self.render_question(ctx).await?;

        let answer_type = match self.options {
            Some(_) => OPTION_ANSWER_TYPE,
            None => "direct",
        };
        let prompt = json!({
            "question": question,
            "answerType": answer_type,
            "options": self.options,
        });
        ctx.callbacks()
            .on_node_interrupt(ctx.node_id(), ctx.alias_name(), prompt);
        log::debug!("QuestionAnswerNode {}: waiting for answer", self.node_id);

        let answer = answer_text(&ctx.wait_for_answer(None).await?);
        log::debug!("QuestionAnswerNode {}: received answer", self.node_id);

        let result = NodeRunResult::succeeded(ctx.node_id(), ctx.alias_name())
            .with_inputs(inputs)
            .with_output(Self::PORT_QUERY, question.into());

        if self.options.is_none() {
            return Ok(result.with_output(Self::PORT_CONTENT, answer.into()));
        }
        let option = self.match_option(&answer).ok_or_else(|| {
            EngineError::node_run(
                ctx.node_id(),
                format!("Answer '{}' matches no option", answer),
            )
        })?;
        Ok(result
            .with_output(Self::PORT_CONTENT, option.content.clone().into())
            .with_output(Self::PORT_ID, option.id.clone().into())
            .with_branch(option.id.clone()))
    }
}

fn create(description: &NodeDescription) -> Result<Arc<dyn WorkflowNode>> {
    Ok(Arc::new(QuestionAnswerNode::from_description(description)?))
}

inventory::submit!(BuiltinNode {
    node_type: "question-answer",
    create,
});
