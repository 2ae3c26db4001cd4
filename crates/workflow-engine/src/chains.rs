//! Root-to-terminal path enumeration
//!
//! A [`SimplePath`] is one route through the graph from the traversal root to
//! a node with no outgoing edges. The engine uses chains two ways: a node
//! waits only for predecessors on chains that are still active, and a node
//! whose every chain has been deactivated is logically skipped.
//!
//! Chains of the top-level graph are the "master" chains; each iteration
//! node gets its own [`Chains`] rooted at its entry node.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::constants::params;
use crate::error::{EngineError, Result};
use crate::status::Signal;
use crate::types::{NodeId, NodeKind, WorkflowDescription};

/// One enumerated root-to-terminal route
#[derive(Debug)]
pub struct SimplePath {
    node_ids: Vec<NodeId>,
    positions: HashMap<NodeId, usize>,
    inactive: Signal,
}

impl SimplePath {
    pub fn new(node_ids: Vec<NodeId>) -> Self {
        let positions = node_ids
            .iter()
            .enumerate()
            .map(|(idx, id)| (id.clone(), idx))
            .collect();
        Self {
            node_ids,
            positions,
            inactive: Signal::new(),
        }
    }

    pub fn node_ids(&self) -> &[NodeId] {
        &self.node_ids
    }

    pub fn len(&self) -> usize {
        self.node_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.positions.contains_key(node_id)
    }

    pub fn position(&self, node_id: &str) -> Option<usize> {
        self.positions.get(node_id).copied()
    }

    /// Fraction of this chain completed once `node_id` is done
    pub fn progress(&self, node_id: &str) -> Option<f32> {
        self.position(node_id)
            .map(|idx| (idx + 1) as f32 / self.node_ids.len() as f32)
    }

    /// Node immediately before `node_id` on this chain
    pub fn predecessor_of(&self, node_id: &str) -> Option<&str> {
        match self.position(node_id) {
            Some(idx) if idx > 0 => Some(&self.node_ids[idx - 1]),
            _ => None,
        }
    }

    /// Whether `to` directly follows `from` on this chain
    pub fn has_segment(&self, from: &str, to: &str) -> bool {
        match self.position(from) {
            Some(idx) => self.node_ids.get(idx + 1).map(String::as_str) == Some(to),
            None => false,
        }
    }

    pub fn inactive(&self) -> &Signal {
        &self.inactive
    }

    pub fn is_inactive(&self) -> bool {
        self.inactive.is_set()
    }

    /// Deactivate the chain; returns `true` if it was active before
    pub fn deactivate(&self) -> bool {
        self.inactive.set()
    }

    fn fresh(&self) -> Self {
        Self::new(self.node_ids.clone())
    }
}

/// Chain set of a graph plus the chain sets of its iteration sub-graphs
#[derive(Debug, Default)]
pub struct Chains {
    master_chains: Vec<SimplePath>,
    /// Keyed by iteration node id
    iteration_chains: BTreeMap<NodeId, Chains>,
    /// Every outgoing target per node, failure edges included
    edge_dict: HashMap<NodeId, Vec<NodeId>>,
}

impl Chains {
    /// Enumerate every simple root-to-terminal path of a description
    pub fn generate(description: &WorkflowDescription, max_chains: usize) -> Result<Self> {
        let edge_dict = edge_dict(description);
        let start = description
            .start_node()
            .ok_or_else(|| EngineError::build("Workflow has no start node"))?;

        let master_chains = enumerate_paths(&start.id, &edge_dict, max_chains)?;

        let mut iteration_chains = BTreeMap::new();
        for node in description.nodes.iter().filter(|n| n.kind() == NodeKind::Iteration) {
            let Some(entry) = node.param_str(params::ITERATION_START_NODE_ID) else {
                return Err(EngineError::build(format!(
                    "Iteration node: {} iteration start node does not exist",
                    node.id
                )));
            };
            let chains = enumerate_paths(entry, &edge_dict, max_chains)?;
            iteration_chains.insert(
                node.id.clone(),
                Chains {
                    master_chains: chains,
                    iteration_chains: BTreeMap::new(),
                    edge_dict: edge_dict.clone(),
                },
            );
        }

        log::debug!(
            "Generated {} master chains and {} iteration chain sets",
            master_chains.len(),
            iteration_chains.len()
        );

        Ok(Self {
            master_chains,
            iteration_chains,
            edge_dict,
        })
    }

    pub fn master_chains(&self) -> &[SimplePath] {
        &self.master_chains
    }

    /// Chain set of one iteration sub-graph
    pub fn for_iteration(&self, iteration_node_id: &str) -> Option<&Chains> {
        self.iteration_chains.get(iteration_node_id)
    }

    pub fn iteration_node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.iteration_chains.keys()
    }

    /// Every chain, master chains first
    pub fn all_chains(&self) -> impl Iterator<Item = &SimplePath> {
        self.master_chains.iter().chain(
            self.iteration_chains
                .values()
                .flat_map(|chains| chains.master_chains.iter()),
        )
    }

    /// Chains containing a node; falls back to iteration chains when the
    /// node is not on any master chain
    pub fn get_node_chains(&self, node_id: &str) -> Vec<&SimplePath> {
        let found: Vec<&SimplePath> = self
            .master_chains
            .iter()
            .filter(|chain| chain.contains(node_id))
            .collect();
        if !found.is_empty() {
            return found;
        }
        self.iteration_chains
            .values()
            .flat_map(|chains| chains.master_chains.iter())
            .filter(|chain| chain.contains(node_id))
            .collect()
    }

    /// Chains on which `to` directly follows `from`
    pub fn get_branch_chains(&self, from: &str, to: &str) -> Vec<&SimplePath> {
        self.all_chains()
            .filter(|chain| chain.has_segment(from, to))
            .collect()
    }

    /// Every outgoing target of a node
    pub fn successors(&self, node_id: &str) -> &[NodeId] {
        self.edge_dict
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Structural copy with every chain active again
    pub fn fresh(&self) -> Self {
        Self {
            master_chains: self.master_chains.iter().map(SimplePath::fresh).collect(),
            iteration_chains: self
                .iteration_chains
                .iter()
                .map(|(id, chains)| (id.clone(), chains.fresh()))
                .collect(),
            edge_dict: self.edge_dict.clone(),
        }
    }

    pub fn to_snapshot(&self) -> ChainsSnapshot {
        ChainsSnapshot {
            master: self
                .master_chains
                .iter()
                .map(|chain| chain.node_ids.clone())
                .collect(),
            iterations: self
                .iteration_chains
                .iter()
                .map(|(id, chains)| {
                    let paths = chains
                        .master_chains
                        .iter()
                        .map(|chain| chain.node_ids.clone())
                        .collect();
                    (id.clone(), paths)
                })
                .collect(),
            edges: self
                .edge_dict
                .iter()
                .map(|(id, targets)| (id.clone(), targets.clone()))
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: ChainsSnapshot) -> Self {
        let edge_dict: HashMap<NodeId, Vec<NodeId>> = snapshot.edges.into_iter().collect();
        let iteration_chains = snapshot
            .iterations
            .into_iter()
            .map(|(id, paths)| {
                let chains = Chains {
                    master_chains: paths.into_iter().map(SimplePath::new).collect(),
                    iteration_chains: BTreeMap::new(),
                    edge_dict: edge_dict.clone(),
                };
                (id, chains)
            })
            .collect();
        Self {
            master_chains: snapshot.master.into_iter().map(SimplePath::new).collect(),
            iteration_chains,
            edge_dict,
        }
    }
}

/// Plain-data form of [`Chains`] for engine snapshots
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainsSnapshot {
    pub master: Vec<Vec<NodeId>>,
    pub iterations: BTreeMap<NodeId, Vec<Vec<NodeId>>>,
    pub edges: BTreeMap<NodeId, Vec<NodeId>>,
}

fn edge_dict(description: &WorkflowDescription) -> HashMap<NodeId, Vec<NodeId>> {
    let mut dict: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for edge in &description.edges {
        let targets = dict.entry(edge.source_node_id.clone()).or_default();
        if !targets.contains(&edge.target_node_id) {
            targets.push(edge.target_node_id.clone());
        }
    }
    dict
}

fn enumerate_paths(
    root: &str,
    edge_dict: &HashMap<NodeId, Vec<NodeId>>,
    max_chains: usize,
) -> Result<Vec<SimplePath>> {
    let mut paths = Vec::new();
    let mut current = vec![root.to_string()];
    let mut on_path: HashSet<NodeId> = HashSet::from([root.to_string()]);
    walk(root, edge_dict, &mut current, &mut on_path, &mut paths, max_chains)?;
    Ok(paths.into_iter().map(SimplePath::new).collect())
}

fn walk(
    node_id: &str,
    edge_dict: &HashMap<NodeId, Vec<NodeId>>,
    current: &mut Vec<NodeId>,
    on_path: &mut HashSet<NodeId>,
    paths: &mut Vec<Vec<NodeId>>,
    max_chains: usize,
) -> Result<()> {
    let mut extended = false;
    for target in edge_dict.get(node_id).into_iter().flatten() {
        // A back edge would revisit a node; the path ends here instead.
        if on_path.contains(target) {
            continue;
        }
        extended = true;
        current.push(target.clone());
        on_path.insert(target.clone());
        walk(target, edge_dict, current, on_path, paths, max_chains)?;
        on_path.remove(target);
        current.pop();
    }

    if !extended {
        if paths.len() >= max_chains {
            return Err(EngineError::build(format!(
                "Workflow expands to more than {} chains",
                max_chains
            )));
        }
        paths.push(current.clone());
    }
    Ok(())
}
