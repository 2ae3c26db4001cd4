//! Chain-of-responsibility error handling
//!
//! A failed attempt is offered to each handler in order (timeout, interrupt,
//! retryable, general). A handler either passes the error on or decides the
//! outcome: retry, recover with a substitute result, or abort the run.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::constants::error_outputs;
use crate::context::RunContext;
use crate::error::EngineError;
use crate::node::EngineNode;
use crate::types::{ErrorStrategy, NodeKind, NodeRunResult, ValueMap};
use crate::variable_pool::StreamFrame;

/// Decision taken by a handler
#[derive(Debug)]
pub enum HandlerOutcome {
    /// Not mine; offer it to the next handler
    Pass(EngineError),
    /// Run the node again
    Retry,
    /// Treat the node as finished with this result
    Recovered(NodeRunResult),
    /// Stop the run with this error
    Abort(EngineError),
}

#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// `attempt` counts the failed attempts before this one
    async fn handle(
        &self,
        error: EngineError,
        node: &EngineNode,
        run: &Arc<RunContext>,
        attempt: u32,
    ) -> HandlerOutcome;
}

/// Ordered handler chain
pub struct ErrorHandlerChain {
    handlers: Vec<Box<dyn ErrorHandler>>,
}

impl ErrorHandlerChain {
    pub fn new() -> Self {
        Self {
            handlers: vec![
                Box::new(TimeoutErrorHandler),
                Box::new(InterruptErrorHandler),
                Box::new(RetryableErrorHandler),
                Box::new(GeneralErrorHandler),
            ],
        }
    }

    pub async fn handle(
        &self,
        mut error: EngineError,
        node: &EngineNode,
        run: &Arc<RunContext>,
        attempt: u32,
    ) -> HandlerOutcome {
        for handler in &self.handlers {
            match handler.handle(error, node, run, attempt).await {
                HandlerOutcome::Pass(passed) => error = passed,
                outcome => return outcome,
            }
        }
        HandlerOutcome::Abort(error)
    }
}

impl Default for ErrorHandlerChain {
    fn default() -> Self {
        Self::new()
    }
}

fn report_failure(node: &EngineNode, run: &RunContext, error: &EngineError) {
    run.event_log.end_node(node.id(), Some(&error.message()));
    run.callbacks
        .on_node_end(node.id(), node.alias_name(), Err(error));
}

/// Timeouts are never retried
pub struct TimeoutErrorHandler;

#[async_trait]
impl ErrorHandler for TimeoutErrorHandler {
    async fn handle(
        &self,
        error: EngineError,
        node: &EngineNode,
        run: &Arc<RunContext>,
        _attempt: u32,
    ) -> HandlerOutcome {
        if !error.is_timeout() {
            return HandlerOutcome::Pass(error);
        }
        log::warn!("Node {} timed out", node.id());
        report_failure(node, run, &error);
        HandlerOutcome::Abort(error)
    }
}

/// Hard interrupts stop the run immediately
pub struct InterruptErrorHandler;

#[async_trait]
impl ErrorHandler for InterruptErrorHandler {
    async fn handle(
        &self,
        error: EngineError,
        node: &EngineNode,
        run: &Arc<RunContext>,
        _attempt: u32,
    ) -> HandlerOutcome {
        if !error.is_interrupt() {
            return HandlerOutcome::Pass(error);
        }
        log::info!("Node {} interrupted: {}", node.id(), error);
        report_failure(node, run, &error);
        HandlerOutcome::Abort(error)
    }
}

/// Business errors: retry up to the bound, then apply the node's strategy
pub struct RetryableErrorHandler;

#[async_trait]
impl ErrorHandler for RetryableErrorHandler {
    async fn handle(
        &self,
        error: EngineError,
        node: &EngineNode,
        run: &Arc<RunContext>,
        attempt: u32,
    ) -> HandlerOutcome {
        if !error.is_business() {
            return HandlerOutcome::Pass(error);
        }

        // Output already reached the user; a second attempt would duplicate it.
        if run
            .variable_pool
            .get_stream_node_has_sent_first_token(node.id())
        {
            let error = EngineError::Interrupted {
                code: error.code(),
                message: error.message(),
            };
            report_failure(node, run, &error);
            return HandlerOutcome::Abort(error);
        }

        let retry = node.retry_config();
        if attempt < retry.effective_max_retries() {
            log::info!(
                "Node {} failed ({}); retry {}/{}",
                node.id(),
                error,
                attempt + 1,
                retry.effective_max_retries()
            );
            run.event_log.end_node(node.id(), Some(&error.message()));
            return HandlerOutcome::Retry;
        }

        match retry.effective_strategy() {
            ErrorStrategy::CustomReturn => {
                let output = retry.custom_output.clone();
                recover_with(node, run, &error, output).await
            }
            ErrorStrategy::FailBranch => recover_with(node, run, &error, ValueMap::new()).await,
            ErrorStrategy::Interrupted => {
                let error = EngineError::Interrupted {
                    code: error.code(),
                    message: error.message(),
                };
                report_failure(node, run, &error);
                HandlerOutcome::Abort(error)
            }
        }
    }
}

/// Build a substitute result, publish it, and tell stream consumers the
/// producer gave up
async fn recover_with(
    node: &EngineNode,
    run: &Arc<RunContext>,
    error: &EngineError,
    outputs: ValueMap,
) -> HandlerOutcome {
    let inputs = run.variable_pool.available_inputs(node.id()).await;

    let mut error_values = ValueMap::new();
    error_values.insert(error_outputs::CODE.to_string(), json!(error.code()));
    error_values.insert(error_outputs::MESSAGE.to_string(), json!(error.message()));

    let result = NodeRunResult::succeeded(node.id(), node.alias_name())
        .with_inputs(inputs)
        .with_outputs(outputs)
        .with_error_outputs(error_values);

    let keys: Vec<String> = result
        .outputs
        .keys()
        .chain(result.error_outputs.keys())
        .cloned()
        .collect();
    if let Err(e) = run
        .variable_pool
        .add_variable(node.id(), &keys, &result)
        .await
    {
        let error = EngineError::VariablePool(format!(
            "Node name: {}, error message: {}",
            node.id(),
            e
        ));
        report_failure(node, run, &error);
        return HandlerOutcome::Abort(error);
    }

    if node.kind().streams_output() {
        let frame = StreamFrame::error(node.id(), error_payload(node));
        let reached = run.variable_pool.publish_stream(frame);
        log::debug!("Node {} error frame sent to {} consumers", node.id(), reached);
    }

    log::info!(
        "Node {} recovered from failure ({}) via fallback output",
        node.id(),
        error
    );
    run.event_log.end_node(node.id(), Some(&error.message()));
    run.callbacks
        .on_node_end(node.id(), node.alias_name(), Ok(&result));
    HandlerOutcome::Recovered(result)
}

/// Error frame shape each streaming kind's consumers expect
fn error_payload(node: &EngineNode) -> Value {
    match node.kind() {
        NodeKind::Agent | NodeKind::Flow => {
            json!({"code": -1, "choices": [{"finish_reason": "stop"}]})
        }
        NodeKind::KnowledgePro => json!({"code": -1, "finish_reason": "stop"}),
        NodeKind::Llm if node.description().param_str("source") == Some("openai") => {
            json!({"code": -1, "choices": [{"finish_reason": "stop"}]})
        }
        NodeKind::Llm => json!({
            "header": {"code": -1, "status": 2},
            "payload": {"choices": {"text": [{}]}},
        }),
        _ => json!({"code": -1}),
    }
}

/// Anything else is wrapped as a node-run error and aborts the run
pub struct GeneralErrorHandler;

#[async_trait]
impl ErrorHandler for GeneralErrorHandler {
    async fn handle(
        &self,
        error: EngineError,
        node: &EngineNode,
        run: &Arc<RunContext>,
        _attempt: u32,
    ) -> HandlerOutcome {
        log::error!("Node {} failed: {}", node.id(), error);
        let error = match error {
            EngineError::NodeRun { .. } | EngineError::BranchNotFound { .. } => error,
            other => EngineError::node_run(node.id(), other.to_string()),
        };
        report_failure(node, run, &error);
        HandlerOutcome::Abort(error)
    }
}
