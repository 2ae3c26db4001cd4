//! Callback events for workflow progress
//!
//! Events are sent from the engine to whoever drives the run (an HTTP
//! stream, a channel, a test collector) to report node lifecycle,
//! streamed output fragments and interactive prompts.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{EngineError, NodeErrorInfo};
use crate::types::NodeRunResult;

/// Trait for sending workflow events
///
/// This abstracts over the transport so the engine can be embedded in
/// different hosts.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be delivered (e.g. channel closed)
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// Events emitted during workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkflowEvent {
    /// Run started
    #[serde(rename_all = "camelCase")]
    WorkflowStarted {
        workflow_id: String,
        execution_id: String,
    },

    /// Run produced its terminal result
    #[serde(rename_all = "camelCase")]
    WorkflowCompleted {
        workflow_id: String,
        execution_id: String,
    },

    /// Run failed
    #[serde(rename_all = "camelCase")]
    WorkflowFailed {
        workflow_id: String,
        execution_id: String,
        error: NodeErrorInfo,
    },

    /// A node started executing
    #[serde(rename_all = "camelCase")]
    NodeStarted {
        node_id: String,
        alias_name: String,
        execution_id: String,
    },

    /// Streamed output fragment of a node
    #[serde(rename_all = "camelCase")]
    NodeProcess {
        node_id: String,
        alias_name: String,
        execution_id: String,
        content: String,
        finished: bool,
    },

    /// A node finished successfully
    #[serde(rename_all = "camelCase")]
    NodeCompleted {
        node_id: String,
        alias_name: String,
        execution_id: String,
        result: Box<NodeRunResult>,
    },

    /// A node finished with an error
    #[serde(rename_all = "camelCase")]
    NodeFailed {
        node_id: String,
        alias_name: String,
        execution_id: String,
        error: NodeErrorInfo,
    },

    /// A node is waiting for external input
    #[serde(rename_all = "camelCase")]
    NodeInterrupted {
        node_id: String,
        alias_name: String,
        execution_id: String,
        prompt: Value,
    },
}

impl WorkflowEvent {
    /// Node the event concerns, if any
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeStarted { node_id, .. }
            | Self::NodeProcess { node_id, .. }
            | Self::NodeCompleted { node_id, .. }
            | Self::NodeFailed { node_id, .. }
            | Self::NodeInterrupted { node_id, .. } => Some(node_id),
            Self::WorkflowStarted { .. }
            | Self::WorkflowCompleted { .. }
            | Self::WorkflowFailed { .. } => None,
        }
    }
}

/// A no-op event sink that discards all events
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: WorkflowEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for tests that assert on emitted events.
pub struct VecEventSink {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().clone()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Forwards events over an unbounded tokio channel
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<WorkflowEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: mpsc::UnboundedSender<WorkflowEvent>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError> {
        self.tx.send(event).map_err(|_| EventError::channel_closed())
    }
}

/// Callback surface handed to nodes
///
/// Wraps the sink with the run's identity. Delivery failures are logged and
/// never fail the run.
#[derive(Clone)]
pub struct WorkflowCallbacks {
    sink: Arc<dyn EventSink>,
    workflow_id: String,
    execution_id: String,
}

impl WorkflowCallbacks {
    pub fn new(
        sink: Arc<dyn EventSink>,
        workflow_id: impl Into<String>,
        execution_id: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            workflow_id: workflow_id.into(),
            execution_id: execution_id.into(),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Err(e) = self.sink.send(event) {
            log::warn!("[{}] Failed to deliver workflow event: {}", self.execution_id, e);
        }
    }

    pub fn on_sparkflow_start(&self) {
        self.emit(WorkflowEvent::WorkflowStarted {
            workflow_id: self.workflow_id.clone(),
            execution_id: self.execution_id.clone(),
        });
    }

    pub fn on_sparkflow_end<T>(&self, outcome: &Result<T, EngineError>) {
        let event = match outcome {
            Ok(_) => WorkflowEvent::WorkflowCompleted {
                workflow_id: self.workflow_id.clone(),
                execution_id: self.execution_id.clone(),
            },
            Err(e) => WorkflowEvent::WorkflowFailed {
                workflow_id: self.workflow_id.clone(),
                execution_id: self.execution_id.clone(),
                error: e.to_info(),
            },
        };
        self.emit(event);
    }

    pub fn on_node_start(&self, node_id: &str, alias_name: &str) {
        self.emit(WorkflowEvent::NodeStarted {
            node_id: node_id.to_string(),
            alias_name: alias_name.to_string(),
            execution_id: self.execution_id.clone(),
        });
    }

    pub fn on_node_process(&self, node_id: &str, alias_name: &str, content: &str, finished: bool) {
        self.emit(WorkflowEvent::NodeProcess {
            node_id: node_id.to_string(),
            alias_name: alias_name.to_string(),
            execution_id: self.execution_id.clone(),
            content: content.to_string(),
            finished,
        });
    }

    pub fn on_node_end(
        &self,
        node_id: &str,
        alias_name: &str,
        outcome: Result<&NodeRunResult, &EngineError>,
    ) {
        let event = match outcome {
            Ok(result) => WorkflowEvent::NodeCompleted {
                node_id: node_id.to_string(),
                alias_name: alias_name.to_string(),
                execution_id: self.execution_id.clone(),
                result: Box::new(result.clone()),
            },
            Err(e) => WorkflowEvent::NodeFailed {
                node_id: node_id.to_string(),
                alias_name: alias_name.to_string(),
                execution_id: self.execution_id.clone(),
                error: e.to_info(),
            },
        };
        self.emit(event);
    }

    pub fn on_node_interrupt(&self, node_id: &str, alias_name: &str, prompt: Value) {
        self.emit(WorkflowEvent::NodeInterrupted {
            node_id: node_id.to_string(),
            alias_name: alias_name.to_string(),
            execution_id: self.execution_id.clone(),
            prompt,
        });
    }
}

impl std::fmt::Debug for WorkflowCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowCallbacks")
            .field("workflow_id", &self.workflow_id)
            .field("execution_id", &self.execution_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_vec_event_sink() {
        let sink = Arc::new(VecEventSink::new());
        let callbacks = WorkflowCallbacks::new(sink.clone(), "wf", "exec1");

        callbacks.on_node_start("spark-llm::1", "llm");
        callbacks.on_node_process("spark-llm::1", "llm", "partial", false);

        let events = sink.events();
        assert_eq!(events.len(), 2);
        match &events[1] {
            WorkflowEvent::NodeProcess { content, finished, .. } => {
                assert_eq!(content, "partial");
                assert!(!finished);
            }
            _ => panic!("Expected NodeProcess event"),
        }
        assert_eq!(events[0].node_id(), Some("spark-llm::1"));

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_node_end_reports_error_code() {
        let sink = Arc::new(VecEventSink::new());
        let callbacks = WorkflowCallbacks::new(sink.clone(), "wf", "exec1");
        let err = EngineError::business(7, "quota");
        callbacks.on_node_end("spark-llm::1", "llm", Err(&err));

        match &sink.events()[0] {
            WorkflowEvent::NodeFailed { error, .. } => assert_eq!(error.code, 7),
            _ => panic!("Expected NodeFailed event"),
        }
    }

    #[test]
    fn test_closed_channel_does_not_panic() {
        let (sink, rx) = ChannelEventSink::channel();
        drop(rx);
        assert!(sink
            .send(WorkflowEvent::WorkflowStarted {
                workflow_id: "wf".into(),
                execution_id: "exec1".into(),
            })
            .is_err());

        let callbacks = WorkflowCallbacks::new(Arc::new(sink), "wf", "exec1");
        callbacks.on_node_interrupt("question-answer::1", "ask", json!({"question": "?"}));
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = WorkflowEvent::WorkflowStarted {
            workflow_id: "wf".into(),
            execution_id: "exec1".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "workflowStarted");
        assert_eq!(value["executionId"], "exec1");
    }
}
