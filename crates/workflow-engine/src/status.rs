//! Per-node lifecycle signals
//!
//! Every node in a run owns five one-shot [`Signal`]s. A signal is set at
//! most once and never cleared, so any number of tasks may wait on it and
//! all of them observe the same transition.
//!
//! ```text
//! idle -> start_with_thread -> [pre_processing] -> processing -> complete
//!   \-> not_run (forces processing, complete and start_with_thread)
//! ```

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{EngineError, Result};
use crate::types::NodeId;

/// One-shot broadcast flag
#[derive(Debug)]
pub struct Signal {
    tx: watch::Sender<bool>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Set the flag. Returns `true` only for the call that actually set it.
    pub fn set(&self) -> bool {
        self.tx.send_if_modified(|set| {
            if *set {
                false
            } else {
                *set = true;
                true
            }
        })
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the flag is set. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// Observable summary of a node's signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeState {
    Idle,
    Launched,
    PreProcessing,
    Processing,
    Complete,
    NotRun,
}

/// The five lifecycle signals of one node
#[derive(Debug, Default)]
pub struct NodeRunningStatus {
    /// A traversal task has been launched for this node
    pub start_with_thread: Signal,
    /// A dependent producer pre-launched this message/terminal node
    pub pre_processing: Signal,
    /// Execution has begun
    pub processing: Signal,
    /// Execution finished, successfully or not
    pub complete: Signal,
    /// Logically skipped: every chain containing the node is inactive
    pub not_run: Signal,
}

impl NodeRunningStatus {
    /// Mark finished; `complete` always implies `processing`
    pub fn mark_complete(&self) {
        self.processing.set();
        self.complete.set();
    }

    /// Mark logically skipped and release every waiter
    pub fn mark_not_run(&self) {
        self.not_run.set();
        self.processing.set();
        self.complete.set();
        self.start_with_thread.set();
    }

    pub fn state(&self) -> NodeState {
        if self.not_run.is_set() {
            NodeState::NotRun
        } else if self.complete.is_set() {
            NodeState::Complete
        } else if self.processing.is_set() {
            NodeState::Processing
        } else if self.pre_processing.is_set() {
            NodeState::PreProcessing
        } else if self.start_with_thread.is_set() {
            NodeState::Launched
        } else {
            NodeState::Idle
        }
    }
}

/// Status signals for every node of one run
#[derive(Debug, Default)]
pub struct NodeStatusTable {
    statuses: HashMap<NodeId, NodeRunningStatus>,
}

impl NodeStatusTable {
    /// Fresh, all-idle table for the given nodes
    pub fn new<I, S>(node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Self {
            statuses: node_ids
                .into_iter()
                .map(|id| (id.into(), NodeRunningStatus::default()))
                .collect(),
        }
    }

    pub fn get(&self, node_id: &str) -> Result<&NodeRunningStatus> {
        self.statuses
            .get(node_id)
            .ok_or_else(|| EngineError::run(format!("No run status for node: {}", node_id)))
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.statuses.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Snapshot of every node's state, ordered by id
    pub fn states(&self) -> BTreeMap<NodeId, NodeState> {
        self.statuses
            .iter()
            .map(|(id, status)| (id.clone(), status.state()))
            .collect()
    }
}
