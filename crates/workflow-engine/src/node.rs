//! Node relationship model and the external execute contract
//!
//! Nodes live in a [`NodeArena`] keyed by id. Relationships (`next`, `fail`,
//! `previous`, branch targets) are id lists populated by the builder and
//! never changed afterwards, so the arena can be shared read-only by every
//! task of every run.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::constants::{params, DEFAULT_INTENT_NAME, OPTION_ANSWER_TYPE};
use crate::context::{NodeContext, RunContext};
use crate::error::{EngineError, Result};
use crate::types::{
    NodeDescription, NodeExecutionStatus, NodeId, NodeKind, NodeRunResult, RetryConfig,
};

/// Contract implemented by every node kind
///
/// The engine supplies a [`NodeContext`] giving access to the variable
/// pool, callbacks, nested iteration engines, event log, dependency map,
/// status table, chains and the built-node arena of the current run.
#[async_trait]
pub trait WorkflowNode: Send + Sync {
    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeRunResult>;
}

/// A compiled node: description, executable instance and relationships
pub struct EngineNode {
    description: NodeDescription,
    kind: NodeKind,
    instance: Arc<dyn WorkflowNode>,
    next: Vec<NodeId>,
    fail: Vec<NodeId>,
    previous: Vec<NodeId>,
    branch_targets: HashMap<String, Vec<NodeId>>,
    default_branch: Option<String>,
}

impl EngineNode {
    pub(crate) fn new(description: NodeDescription, instance: Arc<dyn WorkflowNode>) -> Self {
        let kind = description.kind();
        let default_branch = default_intent_id(&description);
        Self {
            description,
            kind,
            instance,
            next: Vec::new(),
            fail: Vec::new(),
            previous: Vec::new(),
            branch_targets: HashMap::new(),
            default_branch,
        }
    }

    pub fn id(&self) -> &str {
        &self.description.id
    }

    pub fn alias_name(&self) -> &str {
        &self.description.alias_name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn description(&self) -> &NodeDescription {
        &self.description
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.description.retry_config
    }

    pub fn instance(&self) -> &Arc<dyn WorkflowNode> {
        &self.instance
    }

    pub fn next(&self) -> &[NodeId] {
        &self.next
    }

    pub fn fail(&self) -> &[NodeId] {
        &self.fail
    }

    pub fn previous(&self) -> &[NodeId] {
        &self.previous
    }

    /// Targets reachable under a branch label
    pub fn branch_targets(&self, label: &str) -> Option<&[NodeId]> {
        self.branch_targets
            .get(label)
            .map(Vec::as_slice)
            .filter(|targets| !targets.is_empty())
    }

    /// Targets of the decision node's `default` intent
    pub fn default_branch_targets(&self) -> Option<&[NodeId]> {
        self.default_branch
            .as_deref()
            .and_then(|label| self.branch_targets(label))
    }

    /// Failure targets that are not also normal next nodes
    pub fn fail_only_targets(&self) -> Vec<NodeId> {
        self.fail
            .iter()
            .filter(|id| !self.next.contains(id))
            .cloned()
            .collect()
    }

    /// Whether the outgoing edges are mutually exclusive alternatives
    pub fn is_branch_node(&self) -> bool {
        match self.kind {
            NodeKind::DecisionMaking | NodeKind::IfElse => true,
            NodeKind::QuestionAnswer => {
                self.description.param_str(params::ANSWER_TYPE) == Some(OPTION_ANSWER_TYPE)
            }
            _ => false,
        }
    }

    pub(crate) fn add_next(&mut self, target: &str, label: Option<&str>) {
        if !self.next.iter().any(|id| id == target) {
            self.next.push(target.to_string());
        }
        if let Some(label) = label {
            let targets = self.branch_targets.entry(label.to_string()).or_default();
            if !targets.iter().any(|id| id == target) {
                targets.push(target.to_string());
            }
        }
    }

    pub(crate) fn add_fail(&mut self, target: &str) {
        if !self.fail.iter().any(|id| id == target) {
            self.fail.push(target.to_string());
        }
    }

    pub(crate) fn add_previous(&mut self, source: &str) {
        if !self.previous.iter().any(|id| id == source) {
            self.previous.push(source.to_string());
        }
    }

    /// Execution template around the external contract
    ///
    /// Opens the node log, runs the instance, stores a successful result's
    /// outputs in the variable pool and fires node-end for nodes that do not
    /// frame their own output.
    pub(crate) async fn invoke(&self, run: &Arc<RunContext>) -> Result<NodeRunResult> {
        run.event_log()
            .start_node(self.id(), self.alias_name(), self.kind.as_tag());

        let ctx = NodeContext::new(self, run);
        let result = self.instance.execute(&ctx).await?;

        // Failed results are closed by the error chain
        if result.status == NodeExecutionStatus::Cancelled {
            run.event_log().end_node(self.id(), None);
            return Ok(result);
        }
        if !result.is_success() {
            return Ok(result);
        }

        let keys: Vec<String> = result.outputs.keys().cloned().collect();
        run.variable_pool()
            .add_variable(self.id(), &keys, &result)
            .await?;

        if !self.kind.is_output() {
            run.callbacks()
                .on_node_end(self.id(), self.alias_name(), Ok(&result));
        }
        run.event_log().end_node(self.id(), None);
        log::debug!("Node {} finished successfully", self.id());
        Ok(result)
    }
}

impl std::fmt::Debug for EngineNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineNode")
            .field("id", &self.description.id)
            .field("kind", &self.kind)
            .field("next", &self.next)
            .field("fail", &self.fail)
            .field("previous", &self.previous)
            .field("branch_targets", &self.branch_targets)
            .finish()
    }
}

fn default_intent_id(description: &NodeDescription) -> Option<String> {
    description
        .param(params::INTENT_CHAINS)?
        .as_array()?
        .iter()
        .find(|intent| intent.get("name").and_then(|v| v.as_str()) == Some(DEFAULT_INTENT_NAME))
        .and_then(|intent| intent.get("id"))
        .and_then(|id| id.as_str())
        .map(str::to_string)
}

/// Arena of compiled nodes keyed by id
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: HashMap<NodeId, EngineNode>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, node: EngineNode) -> Result<()> {
        if self.nodes.contains_key(node.id()) {
            return Err(EngineError::build(format!(
                "Node: {} duplicate build",
                node.id()
            )));
        }
        self.nodes.insert(node.id().to_string(), node);
        Ok(())
    }

    pub fn get(&self, node_id: &str) -> Result<&EngineNode> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| EngineError::run(format!("Node not found {}", node_id)))
    }

    pub(crate) fn get_mut(&mut self, node_id: &str) -> Result<&mut EngineNode> {
        self.nodes
            .get_mut(node_id)
            .ok_or_else(|| EngineError::build(format!("Node not found {}", node_id)))
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EngineNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl WorkflowNode for Noop {
        async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeRunResult> {
            Ok(NodeRunResult::succeeded(ctx.node_id(), ctx.alias_name()))
        }
    }

    fn node(description: NodeDescription) -> EngineNode {
        EngineNode::new(description, Arc::new(Noop))
    }

    #[test]
    fn test_relationship_lists_deduplicate() {
        let mut n = node(NodeDescription::new("if-else::1", "check"));
        n.add_next("ifly-code::a", Some("case_a"));
        n.add_next("ifly-code::a", Some("case_a"));
        n.add_next("ifly-code::b", Some("case_b"));
        n.add_fail("ifly-code::c");
        n.add_previous("node-start::1");
        n.add_previous("node-start::1");

        assert_eq!(n.next().len(), 2);
        assert_eq!(n.previous().len(), 1);
        assert_eq!(n.branch_targets("case_a").unwrap(), ["ifly-code::a"]);
        assert!(n.branch_targets("case_z").is_none());
        assert_eq!(n.fail_only_targets(), vec!["ifly-code::c".to_string()]);
    }

    #[test]
    fn test_branch_node_classification() {
        assert!(node(NodeDescription::new("if-else::1", "")).is_branch_node());
        assert!(node(NodeDescription::new("decision-making::1", "")).is_branch_node());
        assert!(!node(NodeDescription::new("question-answer::1", "")).is_branch_node());
        assert!(node(
            NodeDescription::new("question-answer::2", "").with_param("answerType", json!("option"))
        )
        .is_branch_node());
        assert!(!node(NodeDescription::new("spark-llm::1", "")).is_branch_node());
    }

    #[test]
    fn test_default_intent_branch() {
        let mut n = node(NodeDescription::new("decision-making::1", "route").with_param(
            "intentChains",
            json!([
                {"id": "intent-a", "name": "billing"},
                {"id": "intent-z", "name": "default"}
            ]),
        ));
        n.add_next("ifly-code::fallback", Some("intent-z"));
        assert_eq!(
            n.default_branch_targets().unwrap(),
            ["ifly-code::fallback"]
        );
    }

    #[test]
    fn test_arena_rejects_duplicates() {
        let mut arena = NodeArena::new();
        arena
            .insert(node(NodeDescription::new("node-start::1", "start")))
            .unwrap();
        let err = arena
            .insert(node(NodeDescription::new("node-start::1", "again")))
            .unwrap_err();
        assert!(err.to_string().contains("duplicate build"));
        assert!(arena.get("node-start::1").is_ok());
        assert!(arena.get("node-end::1").is_err());
    }
}
