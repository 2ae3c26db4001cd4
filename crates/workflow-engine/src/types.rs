//! Core types for workflow descriptions and node results
//!
//! A [`WorkflowDescription`] is the flat node/edge list consumed by the
//! [`crate::EngineBuilder`]. Only the fields the scheduler needs are typed;
//! node-specific configuration travels as opaque JSON in `nodeParam`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{
    DEFAULT_BRANCH_HANDLE, FAIL_HANDLE_MARKER, INTENT_HANDLE_PREFIX, NODE_ID_DELIMITER,
};
use crate::error::NodeErrorInfo;

/// Unique identifier for a node (`<type>::<suffix>`)
pub type NodeId = String;

/// JSON object used for inputs and outputs
pub type ValueMap = Map<String, Value>;

/// Type tag of a node id: the text before the first `::`
pub fn type_tag(node_id: &str) -> &str {
    match node_id.find(NODE_ID_DELIMITER) {
        Some(idx) => &node_id[..idx],
        None => node_id,
    }
}

/// Kind of node, derived from the id's type tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    Start,
    End,
    IterationStart,
    IterationEnd,
    Iteration,
    Message,
    IfElse,
    DecisionMaking,
    QuestionAnswer,
    Llm,
    Agent,
    KnowledgePro,
    Flow,
    Code,
    Plugin,
    /// Any tag the engine has no special handling for
    Other(String),
}

impl NodeKind {
    /// Parse a type tag
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "node-start" => Self::Start,
            "node-end" => Self::End,
            "iteration-node-start" => Self::IterationStart,
            "iteration-node-end" => Self::IterationEnd,
            "iteration" => Self::Iteration,
            "message" => Self::Message,
            "if-else" => Self::IfElse,
            "decision-making" => Self::DecisionMaking,
            "question-answer" => Self::QuestionAnswer,
            "spark-llm" => Self::Llm,
            "agent" => Self::Agent,
            "knowledge-pro-base" => Self::KnowledgePro,
            "flow" => Self::Flow,
            "ifly-code" => Self::Code,
            "plugin" => Self::Plugin,
            other => Self::Other(other.to_string()),
        }
    }

    /// Kind of the node with the given id
    pub fn of(node_id: &str) -> Self {
        Self::from_tag(type_tag(node_id))
    }

    /// The type tag this kind is written as
    pub fn as_tag(&self) -> &str {
        match self {
            Self::Start => "node-start",
            Self::End => "node-end",
            Self::IterationStart => "iteration-node-start",
            Self::IterationEnd => "iteration-node-end",
            Self::Iteration => "iteration",
            Self::Message => "message",
            Self::IfElse => "if-else",
            Self::DecisionMaking => "decision-making",
            Self::QuestionAnswer => "question-answer",
            Self::Llm => "spark-llm",
            Self::Agent => "agent",
            Self::KnowledgePro => "knowledge-pro-base",
            Self::Flow => "flow",
            Self::Code => "ifly-code",
            Self::Plugin => "plugin",
            Self::Other(tag) => tag,
        }
    }

    /// Valid traversal roots
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start | Self::IterationStart)
    }

    /// Nodes whose result is collected as the run's output
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End | Self::IterationEnd)
    }

    /// Message and end nodes own their start/end callback framing
    pub fn is_output(&self) -> bool {
        matches!(self, Self::Message | Self::End)
    }

    /// Nodes that stream partial output to consumers
    pub fn streams_output(&self) -> bool {
        matches!(self, Self::Llm | Self::Agent | Self::KnowledgePro | Self::Flow)
    }

    /// Nodes executed behind the run-wide interactive lock
    pub fn is_interactive(&self) -> bool {
        matches!(self, Self::QuestionAnswer)
    }
}

impl From<String> for NodeKind {
    fn from(tag: String) -> Self {
        Self::from_tag(&tag)
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        kind.as_tag().to_string()
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// What to do once a node's retries are exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorStrategy {
    /// Abort the run
    #[default]
    Interrupted,
    /// Succeed with the node's declared fallback output
    CustomReturn,
    /// Succeed with empty output and route through the failure edges
    FailBranch,
}

/// Per-node retry and error policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Execution timeout in seconds; the engine default applies when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    /// Whether retries and fallback strategies are enabled at all
    pub should_retry: bool,
    pub max_retries: u32,
    pub error_strategy: ErrorStrategy,
    /// Output substituted by [`ErrorStrategy::CustomReturn`]
    pub custom_output: ValueMap,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            should_retry: false,
            max_retries: 0,
            error_strategy: ErrorStrategy::Interrupted,
            custom_output: ValueMap::new(),
        }
    }
}

impl RetryConfig {
    /// Enabled policy with the given bound and strategy
    pub fn retrying(max_retries: u32, error_strategy: ErrorStrategy) -> Self {
        Self {
            should_retry: true,
            max_retries,
            error_strategy,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_secs_f64());
        self
    }

    pub fn with_custom_output(mut self, output: ValueMap) -> Self {
        self.custom_output = output;
        self
    }

    /// Retry bound actually applied (zero when retries are disabled)
    pub fn effective_max_retries(&self) -> u32 {
        if self.should_retry {
            self.max_retries
        } else {
            0
        }
    }

    /// Strategy actually applied (interrupt when retries are disabled)
    pub fn effective_strategy(&self) -> ErrorStrategy {
        if self.should_retry {
            self.error_strategy
        } else {
            ErrorStrategy::Interrupted
        }
    }

    /// Timeout for one attempt, falling back to `default` when unset or invalid
    pub fn timeout_or(&self, default: Duration) -> Duration {
        match self.timeout {
            Some(secs) if secs.is_finite() && secs > 0.0 => {
                Duration::try_from_secs_f64(secs).unwrap_or(default)
            }
            _ => default,
        }
    }
}

/// Source of one declared node input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InputValue {
    /// Constant value
    Literal { content: Value },
    /// Output `name` of another node
    #[serde(rename_all = "camelCase")]
    Ref { node_id: NodeId, name: String },
}

/// Declared input of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInput {
    pub name: String,
    pub value: InputValue,
}

impl NodeInput {
    pub fn literal(name: impl Into<String>, content: Value) -> Self {
        Self {
            name: name.into(),
            value: InputValue::Literal { content },
        }
    }

    pub fn reference(
        name: impl Into<String>,
        node_id: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: InputValue::Ref {
                node_id: node_id.into(),
                name: output.into(),
            },
        }
    }

    /// Producing node, if this input is a reference
    pub fn source_node(&self) -> Option<&str> {
        match &self.value {
            InputValue::Ref { node_id, .. } => Some(node_id),
            InputValue::Literal { .. } => None,
        }
    }
}

/// A node in a workflow description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescription {
    pub id: NodeId,
    #[serde(default)]
    pub alias_name: String,
    #[serde(default)]
    pub retry_config: RetryConfig,
    #[serde(default)]
    pub inputs: Vec<NodeInput>,
    /// Declared output names
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Node-specific configuration, opaque to the scheduler
    #[serde(default)]
    pub node_param: Value,
}

impl NodeDescription {
    pub fn new(id: impl Into<String>, alias_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            alias_name: alias_name.into(),
            retry_config: RetryConfig::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            node_param: Value::Null,
        }
    }

    pub fn with_input(mut self, input: NodeInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn with_retry(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        if !self.node_param.is_object() {
            self.node_param = Value::Object(ValueMap::new());
        }
        if let Value::Object(params) = &mut self.node_param {
            params.insert(key.to_string(), value);
        }
        self
    }

    pub fn kind(&self) -> NodeKind {
        NodeKind::of(&self.id)
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.node_param.get(key)
    }

    /// String parameter; empty strings count as absent
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.param(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn input(&self, name: &str) -> Option<&NodeInput> {
        self.inputs.iter().find(|i| i.name == name)
    }
}

/// How the builder interprets an edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeRole {
    Normal,
    /// Labeled branch edge
    Branch(String),
    /// Taken only when the source resolves through its failure branch
    Failure,
}

/// Normalize a branch selector: `intent_chain|X` becomes `X`
pub fn branch_label(handle: &str) -> &str {
    handle.strip_prefix(INTENT_HANDLE_PREFIX).unwrap_or(handle)
}

/// A directed edge between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDescription {
    pub source_node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    pub target_node_id: NodeId,
}

impl EdgeDescription {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_node_id: source.into(),
            source_handle: None,
            target_node_id: target.into(),
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }

    pub fn role(&self) -> EdgeRole {
        let handle = branch_label(self.source_handle.as_deref().unwrap_or(""));
        if handle.contains(FAIL_HANDLE_MARKER) {
            EdgeRole::Failure
        } else if handle.is_empty() {
            EdgeRole::Normal
        } else {
            EdgeRole::Branch(handle.to_string())
        }
    }

    pub fn is_failure(&self) -> bool {
        self.role() == EdgeRole::Failure
    }
}

/// Flat node/edge list of a workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDescription {
    #[serde(default)]
    pub id: String,
    /// Last modification time (ms since epoch), used to invalidate cached engines
    #[serde(default)]
    pub updated_at: i64,
    pub nodes: Vec<NodeDescription>,
    #[serde(default)]
    pub edges: Vec<EdgeDescription>,
}

impl WorkflowDescription {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeDescription> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The top-level start node
    pub fn start_node(&self) -> Option<&NodeDescription> {
        self.nodes.iter().find(|n| n.kind() == NodeKind::Start)
    }
}

/// Final status of one node execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeExecutionStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// Result returned by a node's execute contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRunResult {
    pub node_id: NodeId,
    #[serde(default)]
    pub alias_name: String,
    pub node_type: String,
    pub status: NodeExecutionStatus,
    #[serde(default)]
    pub inputs: ValueMap,
    #[serde(default)]
    pub outputs: ValueMap,
    #[serde(default)]
    pub error_outputs: ValueMap,
    /// Branch selector; absent means [`DEFAULT_BRANCH_HANDLE`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeErrorInfo>,
}

impl NodeRunResult {
    /// Successful result with no inputs or outputs yet
    pub fn succeeded(node_id: impl Into<String>, alias_name: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            node_type: type_tag(&node_id).to_string(),
            node_id,
            alias_name: alias_name.into(),
            status: NodeExecutionStatus::Succeeded,
            inputs: ValueMap::new(),
            outputs: ValueMap::new(),
            error_outputs: ValueMap::new(),
            edge_source_handle: None,
            raw_output: None,
            error: None,
        }
    }

    /// Failed result carrying the reported error
    pub fn failed(
        node_id: impl Into<String>,
        alias_name: impl Into<String>,
        error: NodeErrorInfo,
    ) -> Self {
        let mut result = Self::succeeded(node_id, alias_name);
        result.status = NodeExecutionStatus::Failed;
        result.error = Some(error);
        result
    }

    pub fn with_inputs(mut self, inputs: ValueMap) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: ValueMap) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }

    pub fn with_error_outputs(mut self, error_outputs: ValueMap) -> Self {
        self.error_outputs = error_outputs;
        self
    }

    pub fn with_branch(mut self, label: impl Into<String>) -> Self {
        self.edge_source_handle = Some(label.into());
        self
    }

    pub fn with_raw_output(mut self, raw: impl Into<String>) -> Self {
        self.raw_output = Some(raw.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == NodeExecutionStatus::Succeeded
    }

    /// Normalized branch selector
    pub fn branch_selector(&self) -> &str {
        branch_label(
            self.edge_source_handle
                .as_deref()
                .unwrap_or(DEFAULT_BRANCH_HANDLE),
        )
    }
}

/// One chat turn of prior conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Chat history addressed to one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(rename = "nodeID")]
    pub node_id: NodeId,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_tag_and_kind() {
        assert_eq!(type_tag("spark-llm::abc-123"), "spark-llm");
        assert_eq!(type_tag("bare"), "bare");
        assert_eq!(NodeKind::of("node-end::1"), NodeKind::End);
        assert_eq!(NodeKind::of("iteration-node-end::1"), NodeKind::IterationEnd);
        assert_eq!(
            NodeKind::of("rpa::7"),
            NodeKind::Other("rpa".to_string())
        );
        assert!(NodeKind::IterationStart.is_start());
        assert!(NodeKind::IterationEnd.is_terminal());
        assert!(!NodeKind::Message.is_terminal());
        assert!(NodeKind::Agent.streams_output());
        assert!(NodeKind::QuestionAnswer.is_interactive());
    }

    #[test]
    fn test_node_kind_serializes_as_tag() {
        let json = serde_json::to_string(&NodeKind::DecisionMaking).unwrap();
        assert_eq!(json, "\"decision-making\"");
        let kind: NodeKind = serde_json::from_str("\"custom-tool\"").unwrap();
        assert_eq!(kind.as_tag(), "custom-tool");
    }

    #[test]
    fn test_edge_roles() {
        let plain = EdgeDescription::new("a::1", "b::1");
        assert_eq!(plain.role(), EdgeRole::Normal);

        let intent = EdgeDescription::new("decision-making::1", "b::1")
            .with_handle("intent_chain|intent-one");
        assert_eq!(intent.role(), EdgeRole::Branch("intent-one".into()));

        let fail = EdgeDescription::new("spark-llm::1", "b::1").with_handle("fail_one_of");
        assert!(fail.is_failure());
    }

    #[test]
    fn test_retry_config_effective_policy() {
        let disabled = RetryConfig {
            max_retries: 5,
            error_strategy: ErrorStrategy::FailBranch,
            ..RetryConfig::default()
        };
        assert_eq!(disabled.effective_max_retries(), 0);
        assert_eq!(disabled.effective_strategy(), ErrorStrategy::Interrupted);

        let enabled = RetryConfig::retrying(2, ErrorStrategy::CustomReturn);
        assert_eq!(enabled.effective_max_retries(), 2);
        assert_eq!(enabled.effective_strategy(), ErrorStrategy::CustomReturn);

        let fallback = Duration::from_secs(60);
        assert_eq!(enabled.timeout_or(fallback), fallback);
        let timed = enabled.with_timeout(Duration::from_millis(1500));
        assert_eq!(timed.timeout_or(fallback), Duration::from_millis(1500));
    }

    #[test]
    fn test_retry_config_deserializes_camel_case() {
        let config: RetryConfig = serde_json::from_value(json!({
            "shouldRetry": true,
            "maxRetries": 3,
            "errorStrategy": "failBranch",
            "timeout": 5
        }))
        .unwrap();
        assert!(config.should_retry);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.error_strategy, ErrorStrategy::FailBranch);
        assert_eq!(config.timeout, Some(5.0));
    }

    #[test]
    fn test_description_roundtrip_fields() {
        let node: NodeDescription = serde_json::from_value(json!({
            "id": "message::1",
            "aliasName": "Reply",
            "inputs": [
                {"name": "answer", "value": {"type": "ref", "nodeId": "spark-llm::1", "name": "output"}},
                {"name": "prefix", "value": {"type": "literal", "content": "AI: "}}
            ],
            "nodeParam": {"template": "{{prefix}}{{answer}}"}
        }))
        .unwrap();
        assert_eq!(node.kind(), NodeKind::Message);
        assert_eq!(node.inputs[0].source_node(), Some("spark-llm::1"));
        assert_eq!(node.inputs[1].source_node(), None);
        assert_eq!(node.param_str("template"), Some("{{prefix}}{{answer}}"));
    }

    #[test]
    fn test_result_branch_selector() {
        let result = NodeRunResult::succeeded("if-else::1", "Check");
        assert_eq!(result.branch_selector(), DEFAULT_BRANCH_HANDLE);
        assert_eq!(result.node_type, "if-else");

        let routed = result.with_branch("intent_chain|yes");
        assert_eq!(routed.branch_selector(), "yes");
    }
}
