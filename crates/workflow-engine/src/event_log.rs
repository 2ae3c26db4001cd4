//! Per-run execution trace
//!
//! One [`NodeLog`] is recorded per execution attempt. The log is shared by
//! a run and all of its nested iteration runs, so entries from every
//! iteration of a loop body appear in order.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Trace of one node execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeLog {
    pub node_id: NodeId,
    pub alias_name: String,
    pub node_type: String,
    /// Milliseconds since epoch
    pub started_at: i64,
    pub ended_at: Option<i64>,
    /// `true` while running and after a clean finish; `false` once failed
    pub running_status: bool,
    pub error_logs: Vec<String>,
    pub next_node_ids: Vec<NodeId>,
    /// 1-based attempt number for this node
    pub attempt: u32,
}

/// Append-only log of node executions
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Mutex<Vec<NodeLog>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an entry for a new attempt of `node_id`
    pub fn start_node(&self, node_id: &str, alias_name: &str, node_type: &str) {
        let mut entries = self.entries.lock();
        let attempt = entries.iter().filter(|e| e.node_id == node_id).count() as u32 + 1;
        entries.push(NodeLog {
            node_id: node_id.to_string(),
            alias_name: alias_name.to_string(),
            node_type: node_type.to_string(),
            started_at: Utc::now().timestamp_millis(),
            ended_at: None,
            running_status: true,
            error_logs: Vec::new(),
            next_node_ids: Vec::new(),
            attempt,
        });
    }

    /// Close the latest open entry of `node_id`, recording an error if given
    ///
    /// Closing an already-closed entry only appends the error.
    pub fn end_node(&self, node_id: &str, error: Option<&str>) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.iter_mut().rev().find(|e| e.node_id == node_id) else {
            log::debug!("No log entry to close for node {}", node_id);
            return;
        };
        if entry.ended_at.is_none() {
            entry.ended_at = Some(Utc::now().timestamp_millis());
        }
        if let Some(error) = error {
            entry.running_status = false;
            entry.error_logs.push(error.to_string());
        }
    }

    /// Record the nodes chosen to run after `node_id`
    pub fn record_next(&self, node_id: &str, next: &[NodeId]) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().rev().find(|e| e.node_id == node_id) {
            entry.next_node_ids = next.to_vec();
        }
    }

    /// Snapshot of every entry, in start order
    pub fn entries(&self) -> Vec<NodeLog> {
        self.entries.lock().clone()
    }

    /// Every attempt of one node
    pub fn node_logs(&self, node_id: &str) -> Vec<NodeLog> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.node_id == node_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempts_are_numbered() {
        let log = EventLog::new();
        log.start_node("spark-llm::1", "llm", "spark-llm");
        log.end_node("spark-llm::1", Some("quota"));
        log.start_node("spark-llm::1", "llm", "spark-llm");
        log.end_node("spark-llm::1", None);

        let attempts = log.node_logs("spark-llm::1");
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].attempt, 1);
        assert!(!attempts[0].running_status);
        assert_eq!(attempts[0].error_logs, vec!["quota".to_string()]);
        assert_eq!(attempts[1].attempt, 2);
        assert!(attempts[1].running_status);
        assert!(attempts[1].ended_at.is_some());
    }

    #[test]
    fn test_record_next_and_unknown_nodes() {
        let log = EventLog::new();
        log.end_node("missing::1", Some("ignored"));
        assert!(log.entries().is_empty());

        log.start_node("if-else::1", "check", "if-else");
        log.record_next("if-else::1", &["node-end::1".to_string()]);
        assert_eq!(log.entries()[0].next_node_ids, vec!["node-end::1"]);
    }
}
