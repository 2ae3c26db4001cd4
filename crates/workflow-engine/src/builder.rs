//! Graph builder
//!
//! Compiles a flat [`WorkflowDescription`] into a [`CompiledGraph`]: node
//! instances with their `next`/`fail`/`previous` lists and branch maps, the
//! enumerated chains, the message/terminal dependency map and one nested
//! engine entry per iteration node.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = NodeRegistry::new();
//! workflow_nodes::register_builtins(&mut registry);
//!
//! let engine = EngineBuilder::new(description, &registry)
//!     .with_config(config)
//!     .build()?;
//! ```

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::chains::Chains;
use crate::config::EngineConfig;
use crate::constants::params;
use crate::deps::{build_msg_or_end_deps, MsgOrEndDeps};
use crate::engine::WorkflowEngine;
use crate::error::{EngineError, Result};
use crate::node::{EngineNode, NodeArena};
use crate::registry::NodeRegistry;
use crate::types::{EdgeRole, NodeDescription, NodeId, NodeKind, WorkflowDescription};

/// Entry point of an iteration node's sub-graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationEngine {
    pub iteration_node_id: NodeId,
    /// The sub-graph's `iteration-node-start` node
    pub entry_node_id: NodeId,
}

/// Immutable result of a build, shared by every run of an engine
#[derive(Debug)]
pub struct CompiledGraph {
    pub(crate) description: WorkflowDescription,
    pub(crate) nodes: NodeArena,
    pub(crate) chains: Chains,
    pub(crate) msg_or_end_deps: MsgOrEndDeps,
    pub(crate) iteration_engines: BTreeMap<NodeId, IterationEngine>,
    pub(crate) start_node_id: NodeId,
    /// Milliseconds since epoch
    pub(crate) build_timestamp: i64,
}

impl CompiledGraph {
    pub fn description(&self) -> &WorkflowDescription {
        &self.description
    }

    pub fn nodes(&self) -> &NodeArena {
        &self.nodes
    }

    pub fn chains(&self) -> &Chains {
        &self.chains
    }

    pub fn msg_or_end_deps(&self) -> &MsgOrEndDeps {
        &self.msg_or_end_deps
    }

    pub fn iteration_engines(&self) -> &BTreeMap<NodeId, IterationEngine> {
        &self.iteration_engines
    }

    pub fn start_node_id(&self) -> &str {
        &self.start_node_id
    }

    pub fn build_timestamp(&self) -> i64 {
        self.build_timestamp
    }
}

/// Builds a [`WorkflowEngine`] from a description
pub struct EngineBuilder<'a> {
    description: WorkflowDescription,
    registry: &'a NodeRegistry,
    config: EngineConfig,
}

impl<'a> EngineBuilder<'a> {
    pub fn new(description: WorkflowDescription, registry: &'a NodeRegistry) -> Self {
        Self {
            description,
            registry,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate and compile the description
    pub fn build(self) -> Result<WorkflowEngine> {
        let (nodes, iteration_engines, start_node_id) =
            compile_nodes(&self.description, self.registry, &self.config)?;

        let chains = Chains::generate(&self.description, self.config.max_chains)?;
        let msg_or_end_deps = build_msg_or_end_deps(&self.description, &chains);

        log::info!(
            "Built workflow {} with {} nodes and {} chains",
            self.description.id,
            nodes.len(),
            chains.master_chains().len()
        );

        let graph = CompiledGraph {
            description: self.description,
            nodes,
            chains,
            msg_or_end_deps,
            iteration_engines,
            start_node_id,
            build_timestamp: Utc::now().timestamp_millis(),
        };
        Ok(WorkflowEngine::new(graph, self.config))
    }
}

/// Rebuild an engine from stored chains and dependency maps
///
/// Node instances are created afresh through the registry.
pub(crate) fn assemble(
    description: WorkflowDescription,
    registry: &NodeRegistry,
    config: EngineConfig,
    chains: Chains,
    msg_or_end_deps: MsgOrEndDeps,
    build_timestamp: i64,
) -> Result<WorkflowEngine> {
    let (nodes, iteration_engines, start_node_id) =
        compile_nodes(&description, registry, &config)?;
    let graph = CompiledGraph {
        description,
        nodes,
        chains,
        msg_or_end_deps,
        iteration_engines,
        start_node_id,
        build_timestamp,
    };
    Ok(WorkflowEngine::new(graph, config))
}

type CompiledNodes = (NodeArena, BTreeMap<NodeId, IterationEngine>, NodeId);

fn compile_nodes(
    description: &WorkflowDescription,
    registry: &NodeRegistry,
    config: &EngineConfig,
) -> Result<CompiledNodes> {
    if description.nodes.len() > config.max_nodes {
        return Err(EngineError::build(format!(
            "Workflow has {} nodes, limit is {}",
            description.nodes.len(),
            config.max_nodes
        )));
    }

    let mut arena = NodeArena::new();
    for node_desc in &description.nodes {
        let instance = registry.create(node_desc)?;
        validate_node(node_desc)?;
        arena.insert(EngineNode::new(node_desc.clone(), instance))?;
    }

    for edge in &description.edges {
        if !arena.contains(&edge.target_node_id) {
            return Err(EngineError::build(format!(
                "Node not found {}",
                edge.target_node_id
            )));
        }
        let source = arena.get_mut(&edge.source_node_id)?;
        match edge.role() {
            EdgeRole::Failure => source.add_fail(&edge.target_node_id),
            EdgeRole::Branch(label) => source.add_next(&edge.target_node_id, Some(&label)),
            EdgeRole::Normal => source.add_next(&edge.target_node_id, None),
        }
        arena
            .get_mut(&edge.target_node_id)?
            .add_previous(&edge.source_node_id);
    }

    let mut iteration_engines = BTreeMap::new();
    for node_desc in description
        .nodes
        .iter()
        .filter(|n| n.kind() == NodeKind::Iteration)
    {
        let entry = node_desc
            .param_str(params::ITERATION_START_NODE_ID)
            .filter(|entry| arena.contains(entry))
            .ok_or_else(|| {
                EngineError::build(format!(
                    "Iteration node: {} iteration start node does not exist",
                    node_desc.id
                ))
            })?;
        iteration_engines.insert(
            node_desc.id.clone(),
            IterationEngine {
                iteration_node_id: node_desc.id.clone(),
                entry_node_id: entry.to_string(),
            },
        );
    }

    let start_node_id = description
        .start_node()
        .map(|n| n.id.clone())
        .ok_or_else(|| EngineError::build("Workflow has no start node"))?;

    Ok((arena, iteration_engines, start_node_id))
}

fn validate_node(node_desc: &NodeDescription) -> Result<()> {
    if node_desc.kind() == NodeKind::DecisionMaking {
        let has_intents = node_desc
            .param(params::INTENT_CHAINS)
            .and_then(|v| v.as_array())
            .is_some_and(|intents| !intents.is_empty());
        if !has_intents {
            return Err(EngineError::build(format!(
                "Decision node: {} declares no intent chains",
                node_desc.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::context::NodeContext;
    use crate::node::WorkflowNode;
    use crate::types::{EdgeDescription, NodeRunResult};

    struct Noop;

    #[async_trait]
    impl WorkflowNode for Noop {
        async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeRunResult> {
            Ok(NodeRunResult::succeeded(ctx.node_id(), ctx.alias_name()))
        }
    }

    fn registry() -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        for tag in [
            "node-start",
            "node-end",
            "if-else",
            "decision-making",
            "ifly-code",
            "iteration",
            "iteration-node-start",
            "iteration-node-end",
        ] {
            registry.register_fn(tag, |_| Ok(Arc::new(Noop)));
        }
        registry
    }

    fn linear() -> WorkflowDescription {
        let mut desc = WorkflowDescription::new("linear");
        desc.nodes = vec![
            NodeDescription::new("node-start::1", "start"),
            NodeDescription::new("ifly-code::1", "code"),
            NodeDescription::new("node-end::1", "end"),
        ];
        desc.edges = vec![
            EdgeDescription::new("node-start::1", "ifly-code::1"),
            EdgeDescription::new("ifly-code::1", "node-end::1"),
            EdgeDescription::new("ifly-code::1", "node-end::1").with_handle("fail_one_of"),
        ];
        desc
    }

    #[test]
    fn test_links_next_fail_and_previous() {
        let engine = EngineBuilder::new(linear(), &registry()).build().unwrap();
        let graph = engine.graph();
        let code = graph.nodes().get("ifly-code::1").unwrap();
        assert_eq!(code.next(), ["node-end::1"]);
        assert_eq!(code.fail(), ["node-end::1"]);
        assert!(code.fail_only_targets().is_empty());
        assert_eq!(
            graph.nodes().get("node-end::1").unwrap().previous(),
            ["ifly-code::1"]
        );
        assert_eq!(graph.start_node_id(), "node-start::1");
        assert!(graph.build_timestamp() > 0);
    }

    #[test]
    fn test_missing_edge_endpoint_is_build_error() {
        let mut desc = linear();
        desc.edges
            .push(EdgeDescription::new("ifly-code::1", "ifly-code::ghost"));
        let err = EngineBuilder::new(desc, &registry()).build().unwrap_err();
        assert!(matches!(err, EngineError::Build(_)));
        assert!(err.to_string().contains("Node not found ifly-code::ghost"));
    }

    #[test]
    fn test_unsupported_type_and_duplicates() {
        let mut desc = linear();
        desc.nodes.push(NodeDescription::new("rpa::1", "robot"));
        let err = EngineBuilder::new(desc, &registry()).build().unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedNodeType(_)));

        let mut desc = linear();
        desc.nodes.push(NodeDescription::new("ifly-code::1", "again"));
        let err = EngineBuilder::new(desc, &registry()).build().unwrap_err();
        assert!(err.to_string().contains("duplicate build"));
    }

    #[test]
    fn test_decision_without_intents_is_rejected() {
        let mut desc = linear();
        desc.nodes
            .push(NodeDescription::new("decision-making::1", "route"));
        let err = EngineBuilder::new(desc, &registry()).build().unwrap_err();
        assert!(err.to_string().contains("declares no intent chains"));
    }

    #[test]
    fn test_iteration_entry_must_exist() {
        let mut desc = linear();
        desc.nodes.push(
            NodeDescription::new("iteration::1", "loop")
                .with_param("iterationStartNodeId", json!("iteration-node-start::missing")),
        );
        let err = EngineBuilder::new(desc, &registry()).build().unwrap_err();
        assert!(err.to_string().contains("iteration start node does not exist"));
    }

    #[test]
    fn test_node_limit() {
        let config = EngineConfig {
            max_nodes: 2,
            ..EngineConfig::default()
        };
        let err = EngineBuilder::new(linear(), &registry())
            .with_config(config)
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::Build(_)));
    }
}
