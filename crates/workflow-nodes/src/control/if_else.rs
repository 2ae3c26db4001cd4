//! If-Else Node
//!
//! Routes execution to the first case whose conditions hold. Each case id
//! is the branch label of the edges leaving the node for that case.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use workflow_engine::constants::DEFAULT_BRANCH_HANDLE;
use workflow_engine::{
    EngineError, NodeContext, NodeDescription, NodeRunResult, Result, ValueMap, WorkflowNode,
};

use crate::template::value_text;
use crate::BuiltinNode;

/// How the conditions of a case combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

/// Comparison applied by one condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOperator {
    Eq,
    Ne,
    Contains,
    NotContains,
    Empty,
    NotEmpty,
    Gt,
    Lt,
    Ge,
    Le,
}

/// `input <operator> value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Name of a declared input
    pub input: String,
    pub operator: CompareOperator,
    #[serde(default)]
    pub value: Value,
}

/// One ordered alternative
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Case {
    pub id: String,
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Equality across JSON types: numbers numerically, the rest by text
fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a == b,
        _ => left == right || value_text(left) == value_text(right),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => s.contains(&value_text(needle)),
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::Object(map) => map.contains_key(&value_text(needle)),
        _ => false,
    }
}

fn compare(left: &Value, right: &Value, test: fn(f64, f64) -> bool) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => test(a, b),
        _ => false,
    }
}

impl CompareOperator {
    /// Apply the operator; ordering comparisons on non-numbers are false
    pub fn apply(self, left: &Value, right: &Value) -> bool {
        match self {
            CompareOperator::Eq => loosely_equal(left, right),
            CompareOperator::Ne => !loosely_equal(left, right),
            CompareOperator::Contains => contains(left, right),
            CompareOperator::NotContains => !contains(left, right),
            CompareOperator::Empty => is_empty(left),
            CompareOperator::NotEmpty => !is_empty(left),
            CompareOperator::Gt => compare(left, right, |a, b| a > b),
            CompareOperator::Lt => compare(left, right, |a, b| a < b),
            CompareOperator::Ge => compare(left, right, |a, b| a >= b),
            CompareOperator::Le => compare(left, right, |a, b| a <= b),
        }
    }
}

impl Case {
    /// Whether the case holds for the resolved inputs
    ///
    /// A case without conditions never matches.
    pub fn matches(&self, values: &ValueMap) -> bool {
        if self.conditions.is_empty() {
            return false;
        }
        let mut results = self.conditions.iter().map(|c| {
            let left = values.get(&c.input).unwrap_or(&Value::Null);
            c.operator.apply(left, &c.value)
        });
        match self.logical_operator {
            LogicalOperator::And => results.all(|ok| ok),
            LogicalOperator::Or => results.any(|ok| ok),
        }
    }
}

/// If-Else Node
///
/// Evaluates its cases in order and selects the first match as the branch
/// label, or `elseBranch` when none holds.
///
/// # Parameters
/// - `cases` - Ordered list of [`Case`]
/// - `elseBranch` - Label taken when no case matches (default `default_chain`)
///
/// # Inputs (from variable pool)
/// - Every input named by a condition
#[derive(Debug, Clone)]
pub struct IfElseNode {
    /// Unique identifier for this node instance
    node_id: String,
    cases: Vec<Case>,
    else_branch: String,
}

impl IfElseNode {
    /// Parameter holding the cases
    pub const PARAM_CASES: &'static str = "cases";
    /// Parameter holding the fallback label
    pub const PARAM_ELSE_BRANCH: &'static str = "elseBranch";

    /// Create a new if-else node
    pub fn new(node_id: impl Into<String>, cases: Vec<Case>, else_branch: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            cases,
            else_branch: else_branch.into(),
        }
    }

    /// Create an if-else node from its description
    ///
    /// Every condition must name a declared input.
    pub fn from_description(description: &NodeDescription) -> Result<Self> {
        let cases: Vec<Case> = description
            .param(Self::PARAM_CASES)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(|e| {
                EngineError::build(format!(
                    "If-else node: {} has malformed cases: {}",
                    description.id, e
                ))
            })?
            .unwrap_or_default();

        if let Some(undeclared) = cases
            .iter()
            .flat_map(|case| &case.conditions)
            .find(|c| description.input(&c.input).is_none())
        {
            return Err(EngineError::build(format!(
                "If-else node: {} compares undeclared input {}",
                description.id, undeclared.input
            )));
        }

        let else_branch = description
            .param_str(Self::PARAM_ELSE_BRANCH)
            .unwrap_or(DEFAULT_BRANCH_HANDLE);
        Ok(Self::new(&description.id, cases, else_branch))
    }

    /// Get the node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Label selected for the resolved inputs
    pub fn select(&self, values: &ValueMap) -> &str {
        self.cases
            .iter()
            .find(|case| case.matches(values))
            .map(|case| case.id.as_str())
            .unwrap_or(&self.else_branch)
    }
}

#[async_trait]
impl WorkflowNode for IfElseNode {
    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeRunResult> {
        let values = ctx.variable_pool().resolve_inputs(ctx.node_id()).await?;
        let branch = self.select(&values).to_string();
        log::debug!("IfElseNode {}: selected branch {}", self.node_id, branch);

        Ok(NodeRunResult::succeeded(ctx.node_id(), ctx.alias_name())
            .with_inputs(values)
            .with_branch(branch))
    }
}

fn create(description: &NodeDescription) -> Result<Arc<dyn WorkflowNode>> {
    Ok(Arc::new(IfElseNode::from_description(description)?))
}

inventory::submit!(BuiltinNode {
    node_type: "if-else",
    create,
});

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use workflow_engine::{
        EdgeDescription, EngineBuilder, NodeInput, NullEventSink, RunRequest, WorkflowDescription,
    };

    use crate::builtin_registry;

    fn values(pairs: &[(&str, Value)]) -> ValueMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_operators() {
        use CompareOperator::*;
        assert!(Eq.apply(&json!("5"), &json!(5)));
        assert!(Eq.apply(&json!("abc"), &json!("abc")));
        assert!(Ne.apply(&json!("abc"), &json!("abd")));
        assert!(Contains.apply(&json!("hello world"), &json!("world")));
        assert!(Contains.apply(&json!([1, 2, 3]), &json!("2")));
        assert!(NotContains.apply(&json!(["a"]), &json!("b")));
        assert!(Empty.apply(&Value::Null, &Value::Null));
        assert!(Empty.apply(&json!("  "), &Value::Null));
        assert!(NotEmpty.apply(&json!([0]), &Value::Null));
        assert!(Gt.apply(&json!(10), &json!("9.5")));
        assert!(Le.apply(&json!(3), &json!(3)));
        assert!(!Lt.apply(&json!("abc"), &json!(1)));
        assert!(Ge.apply(&json!("2"), &json!(1)));
    }

    #[test]
    fn test_case_logic() {
        let case: Case = serde_json::from_value(json!({
            "id": "case_a",
            "logicalOperator": "or",
            "conditions": [
                {"input": "x", "operator": "gt", "value": 10},
                {"input": "y", "operator": "eq", "value": "go"}
            ]
        }))
        .unwrap();
        assert!(case.matches(&values(&[("x", json!(1)), ("y", json!("go"))])));
        assert!(!case.matches(&values(&[("x", json!(1)), ("y", json!("stop"))])));

        let and_case = Case {
            logical_operator: LogicalOperator::And,
            ..case
        };
        assert!(!and_case.matches(&values(&[("x", json!(11)), ("y", json!("stop"))])));
        assert!(and_case.matches(&values(&[("x", json!(11)), ("y", json!("go"))])));
    }

    #[test]
    fn test_select_falls_back_to_else() {
        let node = IfElseNode::new(
            "if-else::1",
            vec![Case {
                id: "case_a".into(),
                logical_operator: LogicalOperator::And,
                conditions: vec![Condition {
                    input: "x".into(),
                    operator: CompareOperator::Eq,
                    value: json!(1),
                }],
            }],
            "case_else",
        );
        assert_eq!(node.select(&values(&[("x", json!(1))])), "case_a");
        assert_eq!(node.select(&values(&[("x", json!(2))])), "case_else");
    }

    #[test]
    fn test_undeclared_condition_input_is_rejected() {
        let desc = NodeDescription::new("if-else::1", "check").with_param(
            "cases",
            json!([{"id": "a", "conditions": [{"input": "ghost", "operator": "empty"}]}]),
        );
        let err = IfElseNode::from_description(&desc).unwrap_err();
        assert!(err.to_string().contains("undeclared input ghost"));
    }

    #[tokio::test]
    async fn test_routes_run_to_matching_case() {
        let mut desc = WorkflowDescription::new("if-else-test");
        desc.nodes = vec![
            NodeDescription::new("node-start::1", "start"),
            NodeDescription::new("if-else::1", "check")
                .with_input(NodeInput::reference("score", "node-start::1", "score"))
                .with_param(
                    "cases",
                    json!([{
                        "id": "case_high",
                        "conditions": [{"input": "score", "operator": "ge", "value": 50}]
                    }]),
                ),
            NodeDescription::new("node-end::high", "high")
                .with_input(NodeInput::literal("grade", json!("pass"))),
            NodeDescription::new("node-end::low", "low")
                .with_input(NodeInput::literal("grade", json!("fail"))),
        ];
        desc.edges = vec![
            EdgeDescription::new("node-start::1", "if-else::1"),
            EdgeDescription::new("if-else::1", "node-end::high").with_handle("case_high"),
            EdgeDescription::new("if-else::1", "node-end::low").with_handle("default_chain"),
        ];
        let engine = EngineBuilder::new(desc, &builtin_registry()).build().unwrap();

        for (score, grade) in [(72, "pass"), (12, "fail")] {
            let inputs = values(&[("score", json!(score))]);
            let result = engine
                .run(RunRequest::new(inputs), Arc::new(NullEventSink))
                .await
                .unwrap();
            assert_eq!(result.outputs.get("grade"), Some(&json!(grade)));
        }
    }
}
