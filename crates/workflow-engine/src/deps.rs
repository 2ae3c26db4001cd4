//! Message/terminal dependency map
//!
//! Output nodes (message and end) frame what the user sees, so they must
//! respect two kinds of ordering:
//!
//! - `node_dep`: earlier output-relevant nodes on the same chain that must
//!   finish first, so frames are emitted in chain order.
//! - `data_dep`: producers whose output the node's inputs reference. When a
//!   producer starts, the engine pre-launches the dependent output node so it
//!   can consume the producer's stream while it is being generated.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::chains::{Chains, SimplePath};
use crate::types::{ErrorStrategy, NodeId, NodeKind, WorkflowDescription};

/// Dependency info for one message/terminal node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsgOrEndDepInfo {
    /// Upstream output-relevant nodes that must finish before this one
    pub node_dep: BTreeSet<NodeId>,
    /// Producers whose output this node's inputs reference
    pub data_dep: BTreeSet<NodeId>,
    /// Per producer: whether a path without failure edges reaches this node
    pub data_dep_path_info: BTreeMap<NodeId, bool>,
}

impl MsgOrEndDepInfo {
    pub fn depends_on_data(&self, producer: &str) -> bool {
        self.data_dep.contains(producer)
    }

    pub fn has_normal_path_from(&self, producer: &str) -> bool {
        self.data_dep_path_info
            .get(producer)
            .copied()
            .unwrap_or(false)
    }
}

/// Dependency info keyed by node id
pub type MsgOrEndDeps = BTreeMap<NodeId, MsgOrEndDepInfo>;

/// Build the dependency map from the enumerated chains
pub(crate) fn build_msg_or_end_deps(
    description: &WorkflowDescription,
    chains: &Chains,
) -> MsgOrEndDeps {
    let mut merged = MsgOrEndDeps::new();

    for chain in chains.all_chains() {
        for (node_id, info) in chain_deps(chain, description, chains) {
            match merged.get_mut(&node_id) {
                Some(existing) => existing.node_dep.extend(info.node_dep),
                None => {
                    merged.insert(node_id, info);
                }
            }
        }
    }

    add_data_deps(description, &mut merged);
    merged
}

fn chain_deps(
    chain: &SimplePath,
    description: &WorkflowDescription,
    chains: &Chains,
) -> BTreeMap<NodeId, MsgOrEndDepInfo> {
    let mut deps: BTreeMap<NodeId, MsgOrEndDepInfo> = BTreeMap::new();
    for node_id in chain.node_ids().iter().rev() {
        if !tracks_output_order(node_id, description, chains) {
            continue;
        }
        // Walking backwards: every node already recorded comes later in the chain.
        for later in deps.values_mut() {
            later.node_dep.insert(node_id.clone());
        }
        deps.insert(node_id.clone(), MsgOrEndDepInfo::default());
    }
    deps
}

fn tracks_output_order(node_id: &str, description: &WorkflowDescription, chains: &Chains) -> bool {
    match NodeKind::of(node_id) {
        NodeKind::Message
        | NodeKind::End
        | NodeKind::IfElse
        | NodeKind::DecisionMaking
        | NodeKind::QuestionAnswer => true,
        NodeKind::Iteration => iteration_has_message(node_id, chains),
        _ => description.node(node_id).is_some_and(|node| {
            node.retry_config.should_retry
                && node.retry_config.error_strategy == ErrorStrategy::FailBranch
        }),
    }
}

fn iteration_has_message(iteration_node_id: &str, chains: &Chains) -> bool {
    chains.for_iteration(iteration_node_id).is_some_and(|sub| {
        sub.master_chains().iter().any(|chain| {
            chain
                .node_ids()
                .iter()
                .any(|id| NodeKind::of(id) == NodeKind::Message)
        })
    })
}

fn add_data_deps(description: &WorkflowDescription, deps: &mut MsgOrEndDeps) {
    for node in &description.nodes {
        if !node.kind().is_output() {
            continue;
        }
        for producer in node.inputs.iter().filter_map(|input| input.source_node()) {
            let info = deps.entry(node.id.clone()).or_default();
            info.data_dep.insert(producer.to_string());
            if has_normal_path(description, producer, &node.id) {
                info.data_dep_path_info.insert(producer.to_string(), true);
            }
        }
    }
}

/// Whether `target` is reachable from `source` without crossing a failure edge
pub(crate) fn has_normal_path(description: &WorkflowDescription, source: &str, target: &str) -> bool {
    let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in description.edges.iter().filter(|e| !e.is_failure()) {
        graph
            .entry(edge.source_node_id.as_str())
            .or_default()
            .push(edge.target_node_id.as_str());
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack = vec![source];
    while let Some(node) = stack.pop() {
        if node == target {
            return true;
        }
        if !visited.insert(node) {
            continue;
        }
        if let Some(targets) = graph.get(node) {
            stack.extend(targets.iter().filter(|t| !visited.contains(*t)));
        }
    }
    false
}
