//! Run-scoped variable store
//!
//! Node outputs are kept in a `graph_flow::Context` under
//! `{node_id}.output.{key}`. Downstream nodes read them back by resolving
//! their declared inputs, which are either literals or references to another
//! node's output.
//!
//! The pool also owns the streaming plumbing between producers (LLM-like
//! nodes) and the output nodes consuming them: one [`StreamQueue`] per
//! consumer/producer pair, plus a one-shot "first token sent" signal per
//! producer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use graph_flow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::{codes, EngineError, Result};
use crate::status::Signal;
use crate::types::{
    ChatMessage, InputValue, NodeId, NodeInput, NodeRunResult, ValueMap, WorkflowDescription,
};

/// Key builders for the backing context
pub struct ContextKeys;

impl ContextKeys {
    /// Build an output key: `{node_id}.output.{key}`
    pub fn output(node_id: &str, key: &str) -> String {
        format!("{}.output.{}", node_id, key)
    }

    /// Build a history key: `{node_id}.meta.history`
    pub fn history(node_id: &str) -> String {
        format!("{}.meta.history", node_id)
    }

    /// Key holding the run's inputs
    pub fn run_inputs() -> String {
        "workflow.meta.inputs".to_string()
    }
}

/// One fragment of streamed output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFrame {
    /// Producing node
    pub node_id: NodeId,
    pub content: String,
    /// Last frame of the stream
    pub finished: bool,
    /// The producer failed; `payload` carries the error shape
    pub exception_occurred: bool,
    #[serde(default)]
    pub payload: Value,
}

impl StreamFrame {
    pub fn chunk(node_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            content: content.into(),
            finished: false,
            exception_occurred: false,
            payload: Value::Null,
        }
    }

    pub fn end(node_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            finished: true,
            ..Self::chunk(node_id, content)
        }
    }

    /// Terminal frame reporting a producer failure
    pub fn error(node_id: impl Into<String>, payload: Value) -> Self {
        Self {
            node_id: node_id.into(),
            content: String::new(),
            finished: true,
            exception_occurred: true,
            payload,
        }
    }
}

/// Unbounded async queue of stream frames with a bounded `get`
#[derive(Debug)]
pub struct StreamQueue {
    tx: mpsc::UnboundedSender<StreamFrame>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<StreamFrame>>,
}

impl StreamQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn put(&self, frame: StreamFrame) {
        // The receiver lives in `self`, so sending cannot fail while we exist.
        let _ = self.tx.send(frame);
    }

    /// Next frame, waiting at most `timeout`
    ///
    /// Expiry means the producer stalled and is reported as a business error.
    pub async fn get(&self, timeout: Duration) -> Result<StreamFrame> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(EngineError::run("Stream queue closed")),
            Err(_) => Err(EngineError::business(
                codes::STREAM_STALLED,
                format!("No stream frame received within {:?}", timeout),
            )),
        }
    }

    /// Next frame if one is already buffered
    pub fn try_get(&self) -> Option<StreamFrame> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

impl Default for StreamQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared variable store of one run (and its nested iteration runs)
pub struct VariablePool {
    context: Context,
    inputs: HashMap<NodeId, Vec<NodeInput>>,
    first_tokens: Mutex<HashMap<NodeId, Arc<Signal>>>,
    /// consumer -> producer -> queue
    stream_data: Mutex<HashMap<NodeId, HashMap<NodeId, Arc<StreamQueue>>>>,
    answers: Mutex<HashMap<NodeId, Arc<watch::Sender<Option<Value>>>>>,
}

impl VariablePool {
    /// Fresh pool for a compiled description
    pub fn new(description: &WorkflowDescription) -> Self {
        Self {
            context: Context::new(),
            inputs: description
                .nodes
                .iter()
                .map(|node| (node.id.clone(), node.inputs.clone()))
                .collect(),
            first_tokens: Mutex::new(HashMap::new()),
            stream_data: Mutex::new(HashMap::new()),
            answers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn set_run_inputs(&self, inputs: &ValueMap) {
        self.context.set(&ContextKeys::run_inputs(), inputs).await;
    }

    pub async fn run_inputs(&self) -> ValueMap {
        self.context
            .get(&ContextKeys::run_inputs())
            .await
            .unwrap_or_default()
    }

    pub async fn add_history(&self, node_id: &str, messages: Vec<ChatMessage>) {
        self.context.set(&ContextKeys::history(node_id), messages).await;
    }

    pub async fn history(&self, node_id: &str) -> Vec<ChatMessage> {
        self.context
            .get(&ContextKeys::history(node_id))
            .await
            .unwrap_or_default()
    }

    /// Declared input names of a node
    pub fn input_names(&self, node_id: &str) -> Vec<String> {
        self.inputs
            .get(node_id)
            .map(|inputs| inputs.iter().map(|i| i.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Declared input of a node
    pub fn input(&self, node_id: &str, key: &str) -> Option<&NodeInput> {
        self.inputs.get(node_id)?.iter().find(|i| i.name == key)
    }

    /// Resolve one declared input of a node
    pub async fn get_variable(&self, node_id: &str, key: &str) -> Result<Value> {
        let input = self.input(node_id, key).ok_or_else(|| {
            EngineError::VariablePool(format!("Node {} declares no input {}", node_id, key))
        })?;

        match &input.value {
            InputValue::Literal { content } => Ok(content.clone()),
            InputValue::Ref { node_id: source, name } => {
                self.get_output(source, name).await.ok_or_else(|| {
                    EngineError::VariablePool(format!(
                        "Input {} of node {}: {}.{} has no value",
                        key, node_id, source, name
                    ))
                })
            }
        }
    }

    /// Resolve every declared input of a node
    pub async fn resolve_inputs(&self, node_id: &str) -> Result<ValueMap> {
        let mut resolved = ValueMap::new();
        for name in self.input_names(node_id) {
            let value = self.get_variable(node_id, &name).await?;
            resolved.insert(name, value);
        }
        Ok(resolved)
    }

    /// Resolve the declared inputs that currently have a value
    pub async fn available_inputs(&self, node_id: &str) -> ValueMap {
        let mut resolved = ValueMap::new();
        for name in self.input_names(node_id) {
            if let Ok(value) = self.get_variable(node_id, &name).await {
                resolved.insert(name, value);
            }
        }
        resolved
    }

    pub async fn get_output(&self, node_id: &str, key: &str) -> Option<Value> {
        self.context.get(&ContextKeys::output(node_id, key)).await
    }

    pub async fn set_output(&self, node_id: &str, key: &str, value: Value) {
        self.context
            .set(&ContextKeys::output(node_id, key), value)
            .await;
    }

    /// Store the named keys of a result
    ///
    /// Each key is looked up in the outputs first, then in the error outputs.
    pub async fn add_variable(
        &self,
        node_id: &str,
        keys: &[String],
        result: &NodeRunResult,
    ) -> Result<()> {
        for key in keys {
            let value = result
                .outputs
                .get(key)
                .or_else(|| result.error_outputs.get(key))
                .ok_or_else(|| {
                    EngineError::VariablePool(format!(
                        "Node {} result has no output {}",
                        node_id, key
                    ))
                })?;
            self.set_output(node_id, key, value.clone()).await;
        }
        Ok(())
    }

    /// One-shot signal set when a producer streams its first fragment
    pub fn first_token_signal(&self, node_id: &str) -> Arc<Signal> {
        self.first_tokens
            .lock()
            .entry(node_id.to_string())
            .or_default()
            .clone()
    }

    /// Returns `true` if this call flipped the flag
    pub fn set_stream_node_has_sent_first_token(&self, node_id: &str) -> bool {
        self.first_token_signal(node_id).set()
    }

    pub fn get_stream_node_has_sent_first_token(&self, node_id: &str) -> bool {
        self.first_tokens
            .lock()
            .get(node_id)
            .is_some_and(|signal| signal.is_set())
    }

    /// Replace a producer's first-token signal with an unset one
    pub fn reset_first_token(&self, node_id: &str) {
        self.first_tokens
            .lock()
            .insert(node_id.to_string(), Arc::default());
    }

    /// Replace the queue between `consumer` and `producer` with an empty one
    pub fn reset_stream(&self, consumer: &str, producer: &str) -> Arc<StreamQueue> {
        let queue = Arc::new(StreamQueue::new());
        self.stream_data
            .lock()
            .entry(consumer.to_string())
            .or_default()
            .insert(producer.to_string(), queue.clone());
        queue
    }

    /// Queue carrying `producer`'s stream to `consumer`, created on first use
    pub fn register_stream(&self, consumer: &str, producer: &str) -> Arc<StreamQueue> {
        self.stream_data
            .lock()
            .entry(consumer.to_string())
            .or_default()
            .entry(producer.to_string())
            .or_default()
            .clone()
    }

    pub fn stream_queue(&self, consumer: &str, producer: &str) -> Option<Arc<StreamQueue>> {
        self.stream_data.lock().get(consumer)?.get(producer).cloned()
    }

    /// Consumers with a live queue from `producer`, sorted
    pub fn stream_consumers(&self, producer: &str) -> Vec<NodeId> {
        let mut consumers: Vec<NodeId> = self
            .stream_data
            .lock()
            .iter()
            .filter(|(_, producers)| producers.contains_key(producer))
            .map(|(consumer, _)| consumer.clone())
            .collect();
        consumers.sort();
        consumers
    }

    /// Fan a frame out to every consumer of its producer
    ///
    /// The first regular frame marks the producer as having sent its first
    /// token. Returns the number of queues reached.
    pub fn publish_stream(&self, frame: StreamFrame) -> usize {
        if !frame.exception_occurred {
            self.set_stream_node_has_sent_first_token(&frame.node_id);
        }
        let queues: Vec<Arc<StreamQueue>> = self
            .stream_data
            .lock()
            .values()
            .filter_map(|producers| producers.get(&frame.node_id).cloned())
            .collect();
        for queue in &queues {
            queue.put(frame.clone());
        }
        queues.len()
    }

    fn answer_slot(&self, node_id: &str) -> Arc<watch::Sender<Option<Value>>> {
        self.answers
            .lock()
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(watch::channel(None).0))
            .clone()
    }

    /// Deliver an external answer to an interactive node
    pub fn submit_answer(&self, node_id: &str, answer: Value) {
        self.answer_slot(node_id).send_replace(Some(answer));
    }

    /// Wait for and consume the next answer addressed to `node_id`
    pub async fn wait_for_answer(&self, node_id: &str, timeout: Duration) -> Result<Value> {
        let slot = self.answer_slot(node_id);
        let mut rx = slot.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => return Err(EngineError::run("Answer channel closed")),
            Err(_) => {
                return Err(EngineError::interrupted(format!(
                    "No answer for node {} within {:?}",
                    node_id, timeout
                )))
            }
        }
        slot.send_replace(None)
            .ok_or_else(|| EngineError::run(format!("Answer for node {} already taken", node_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeDescription;
    use serde_json::json;

    fn pool() -> VariablePool {
        let mut desc = WorkflowDescription::new("pool");
        desc.nodes.push(NodeDescription::new("node-start::1", "start"));
        desc.nodes.push(
            NodeDescription::new("node-end::1", "end")
                .with_input(NodeInput::reference("answer", "spark-llm::1", "output"))
                .with_input(NodeInput::literal("prefix", json!("AI: "))),
        );
        VariablePool::new(&desc)
    }

    #[tokio::test]
    async fn test_literal_and_reference_inputs() {
        let pool = pool();
        assert_eq!(
            pool.get_variable("node-end::1", "prefix").await.unwrap(),
            json!("AI: ")
        );
        assert!(pool.get_variable("node-end::1", "answer").await.is_err());
        assert!(pool.get_variable("node-end::1", "missing").await.is_err());

        pool.set_output("spark-llm::1", "output", json!("hello")).await;
        let inputs = pool.resolve_inputs("node-end::1").await.unwrap();
        assert_eq!(inputs["answer"], json!("hello"));
        assert_eq!(inputs.len(), 2);
    }

    #[tokio::test]
    async fn test_add_variable_reads_outputs_then_error_outputs() {
        let pool = pool();
        let mut error_outputs = ValueMap::new();
        error_outputs.insert("errorCode".into(), json!(20102));
        let result = NodeRunResult::succeeded("spark-llm::1", "llm")
            .with_output("output", json!("fallback"))
            .with_error_outputs(error_outputs);

        pool.add_variable(
            "spark-llm::1",
            &["output".to_string(), "errorCode".to_string()],
            &result,
        )
        .await
        .unwrap();
        assert_eq!(
            pool.get_output("spark-llm::1", "errorCode").await,
            Some(json!(20102))
        );

        let err = pool
            .add_variable("spark-llm::1", &["nope".to_string()], &result)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::VariablePool(_)));
    }

    #[tokio::test]
    async fn test_stream_fan_out_and_first_token() {
        let pool = pool();
        let queue = pool.register_stream("node-end::1", "spark-llm::1");
        assert_eq!(pool.stream_consumers("spark-llm::1"), vec!["node-end::1"]);
        assert!(!pool.get_stream_node_has_sent_first_token("spark-llm::1"));

        assert_eq!(pool.publish_stream(StreamFrame::chunk("spark-llm::1", "he")), 1);
        pool.publish_stream(StreamFrame::end("spark-llm::1", "llo"));
        assert!(pool.get_stream_node_has_sent_first_token("spark-llm::1"));

        let first = queue.get(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.content, "he");
        let last = queue.get(Duration::from_millis(50)).await.unwrap();
        assert!(last.finished);
    }

    #[tokio::test]
    async fn test_reset_clears_first_token_and_pending_frames() {
        let pool = pool();
        let stale = pool.register_stream("node-end::1", "spark-llm::1");
        pool.publish_stream(StreamFrame::chunk("spark-llm::1", "left over"));
        assert!(pool.get_stream_node_has_sent_first_token("spark-llm::1"));

        pool.reset_first_token("spark-llm::1");
        let fresh = pool.reset_stream("node-end::1", "spark-llm::1");
        assert!(!pool.get_stream_node_has_sent_first_token("spark-llm::1"));
        assert!(fresh.try_get().is_none());
        assert!(stale.try_get().is_some());

        pool.publish_stream(StreamFrame::chunk("spark-llm::1", "next"));
        let frame = fresh.get(Duration::from_millis(50)).await.unwrap();
        assert_eq!(frame.content, "next");
        assert!(Arc::ptr_eq(
            &pool.stream_queue("node-end::1", "spark-llm::1").unwrap(),
            &fresh
        ));
    }

    #[tokio::test]
    async fn test_stalled_stream_is_business_error() {
        let queue = StreamQueue::new();
        let err = queue.get(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_business());
        assert_eq!(err.code(), codes::STREAM_STALLED);
    }

    #[tokio::test]
    async fn test_answers_are_consumed_once() {
        let pool = Arc::new(pool());
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.wait_for_answer("question-answer::1", Duration::from_secs(1))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.submit_answer("question-answer::1", json!("yes"));
        assert_eq!(waiter.await.unwrap().unwrap(), json!("yes"));

        let err = pool
            .wait_for_answer("question-answer::1", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_interrupt());
    }

    #[tokio::test]
    async fn test_run_inputs_and_history() {
        let pool = pool();
        let mut inputs = ValueMap::new();
        inputs.insert("query".into(), json!("weather"));
        pool.set_run_inputs(&inputs).await;
        assert_eq!(pool.run_inputs().await, inputs);

        pool.add_history("spark-llm::1", vec![ChatMessage::new("user", "hi")])
            .await;
        assert_eq!(pool.history("spark-llm::1").await.len(), 1);
        assert!(pool.history("spark-llm::2").await.is_empty());
    }
}
