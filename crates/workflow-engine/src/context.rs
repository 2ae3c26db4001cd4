//! Run-scoped state and the view of it handed to nodes
//!
//! A [`RunContext`] is created per run (and per nested iteration run). The
//! compiled graph is shared read-only; chain flags and status signals are
//! fresh per run because one-shot signals are never reset. The variable
//! pool, callbacks, event log and interactive lock are shared with nested
//! runs.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::builder::{CompiledGraph, IterationEngine};
use crate::chains::Chains;
use crate::config::EngineConfig;
use crate::deps::{MsgOrEndDepInfo, MsgOrEndDeps};
use crate::error::{EngineError, Result};
use crate::error_chain::ErrorHandlerChain;
use crate::event_log::EventLog;
use crate::events::WorkflowCallbacks;
use crate::node::{EngineNode, NodeArena};
use crate::status::{NodeStatusTable, Signal};
use crate::strategy::StrategySelector;
use crate::types::{InputValue, NodeDescription, NodeId, NodeKind, NodeRunResult, ValueMap};
use crate::variable_pool::VariablePool;

/// Output of one registered run task
pub(crate) type TaskOutput = Result<Option<NodeRunResult>>;

/// Boxed future of one run task
pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = TaskOutput> + Send>>;

/// In-flight tasks of one run
///
/// Tasks are registered before their spawner returns, so draining until
/// the registry is empty also covers tasks spawned while draining.
#[derive(Debug, Default)]
pub(crate) struct TaskRegistry {
    next_id: AtomicU64,
    cancelled: AtomicBool,
    handles: Mutex<Vec<(u64, JoinHandle<TaskOutput>)>>,
}

impl TaskRegistry {
    /// Spawn a task; the closure receives the task's registry id
    pub(crate) fn spawn<F>(&self, make: F) -> u64
    where
        F: FnOnce(u64) -> TaskFuture,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(make(id));
        let mut handles = self.handles.lock();
        if self.cancelled.load(Ordering::SeqCst) {
            handle.abort();
        }
        handles.push((id, handle));
        id
    }

    /// Abort every task except `keep`; later spawns are aborted immediately
    pub(crate) fn cancel_all_except(&self, keep: Option<u64>) {
        self.cancelled.store(true, Ordering::SeqCst);
        for (id, handle) in self.handles.lock().iter() {
            if Some(*id) != keep {
                handle.abort();
            }
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Await every task, collecting returned results and the first error
    ///
    /// The first error cancels everything still running.
    pub(crate) async fn drain(&self) -> (Vec<NodeRunResult>, Option<EngineError>) {
        let mut results = Vec::new();
        let mut first_error = None;

        loop {
            let batch = std::mem::take(&mut *self.handles.lock());
            if batch.is_empty() {
                break;
            }
            for (_, handle) in batch {
                let error = match handle.await {
                    Ok(Ok(Some(result))) => {
                        results.push(result);
                        continue;
                    }
                    Ok(Ok(None)) => continue,
                    Err(e) if e.is_cancelled() => continue,
                    Ok(Err(e)) => e,
                    Err(e) => EngineError::run(format!("Run task panicked: {}", e)),
                };
                if first_error.is_none() {
                    self.cancel_all_except(None);
                    first_error = Some(error);
                } else {
                    log::debug!("Suppressed secondary run error: {}", error);
                }
            }
        }
        (results, first_error)
    }
}

/// Mutable and shared state of one run
pub struct RunContext {
    pub(crate) execution_id: String,
    pub(crate) graph: Arc<CompiledGraph>,
    pub(crate) root: NodeId,
    pub(crate) inputs: ValueMap,
    pub(crate) chains: Chains,
    pub(crate) status: NodeStatusTable,
    pub(crate) variable_pool: Arc<VariablePool>,
    pub(crate) callbacks: WorkflowCallbacks,
    pub(crate) event_log: Arc<EventLog>,
    pub(crate) interactive_lock: Arc<tokio::sync::Mutex<()>>,
    pub(crate) strategies: Arc<StrategySelector>,
    pub(crate) error_chain: Arc<ErrorHandlerChain>,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) responses: Mutex<Vec<NodeRunResult>>,
    pub(crate) tasks: TaskRegistry,
    pub(crate) end_complete: Signal,
}

/// Collaborators shared by a top-level run and all of its nested runs
pub(crate) struct SharedRunState {
    pub(crate) execution_id: String,
    pub(crate) variable_pool: Arc<VariablePool>,
    pub(crate) callbacks: WorkflowCallbacks,
    pub(crate) event_log: Arc<EventLog>,
    pub(crate) interactive_lock: Arc<tokio::sync::Mutex<()>>,
    pub(crate) strategies: Arc<StrategySelector>,
    pub(crate) error_chain: Arc<ErrorHandlerChain>,
    pub(crate) config: Arc<EngineConfig>,
}

impl RunContext {
    pub(crate) fn new(
        graph: Arc<CompiledGraph>,
        chains: Chains,
        root: NodeId,
        inputs: ValueMap,
        shared: SharedRunState,
    ) -> Self {
        let status = NodeStatusTable::new(graph.nodes.ids().cloned());
        Self {
            execution_id: shared.execution_id,
            graph,
            root,
            inputs,
            chains,
            status,
            variable_pool: shared.variable_pool,
            callbacks: shared.callbacks,
            event_log: shared.event_log,
            interactive_lock: shared.interactive_lock,
            strategies: shared.strategies,
            error_chain: shared.error_chain,
            config: shared.config,
            responses: Mutex::new(Vec::new()),
            tasks: TaskRegistry::default(),
            end_complete: Signal::new(),
        }
    }

    /// Collaborators to hand to a nested run
    pub(crate) fn shared(&self) -> SharedRunState {
        SharedRunState {
            execution_id: self.execution_id.clone(),
            variable_pool: self.variable_pool.clone(),
            callbacks: self.callbacks.clone(),
            event_log: self.event_log.clone(),
            interactive_lock: self.interactive_lock.clone(),
            strategies: self.strategies.clone(),
            error_chain: self.error_chain.clone(),
            config: self.config.clone(),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn variable_pool(&self) -> &Arc<VariablePool> {
        &self.variable_pool
    }

    pub fn callbacks(&self) -> &WorkflowCallbacks {
        &self.callbacks
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    pub fn node_status(&self) -> &NodeStatusTable {
        &self.status
    }

    pub fn chains(&self) -> &Chains {
        &self.chains
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether a node belongs to the sub-graph this run traverses
    pub(crate) fn owns(&self, node_id: &str) -> bool {
        self.chains
            .master_chains()
            .iter()
            .any(|chain| chain.contains(node_id))
    }

    pub(crate) fn push_response(&self, result: NodeRunResult) {
        self.responses.lock().push(result);
    }
}

/// Cancels a run's tasks when the future driving it is dropped
pub(crate) struct CancelOnDrop(pub(crate) Arc<RunContext>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.tasks.cancel_all_except(None);
    }
}

/// What a node sees while executing
///
/// Gives access to the variable pool, callbacks, nested iteration engines,
/// event log, dependency map, status table, chains and built nodes of the
/// current run.
pub struct NodeContext<'a> {
    node: &'a EngineNode,
    run: &'a Arc<RunContext>,
}

impl<'a> NodeContext<'a> {
    pub(crate) fn new(node: &'a EngineNode, run: &'a Arc<RunContext>) -> Self {
        Self { node, run }
    }

    pub fn node_id(&self) -> &str {
        self.node.id()
    }

    pub fn alias_name(&self) -> &str {
        self.node.alias_name()
    }

    pub fn kind(&self) -> &NodeKind {
        self.node.kind()
    }

    pub fn node(&self) -> &EngineNode {
        self.node
    }

    pub fn description(&self) -> &NodeDescription {
        self.node.description()
    }

    pub fn execution_id(&self) -> &str {
        &self.run.execution_id
    }

    pub fn variable_pool(&self) -> &VariablePool {
        &self.run.variable_pool
    }

    pub fn callbacks(&self) -> &WorkflowCallbacks {
        &self.run.callbacks
    }

    pub fn iteration_engines(&self) -> &BTreeMap<NodeId, IterationEngine> {
        &self.run.graph.iteration_engines
    }

    pub fn event_log(&self) -> &EventLog {
        &self.run.event_log
    }

    pub fn msg_or_end_deps(&self) -> &MsgOrEndDeps {
        &self.run.graph.msg_or_end_deps
    }

    /// Dependency info of this node, if it is tracked
    pub fn own_deps(&self) -> Option<&MsgOrEndDepInfo> {
        self.run.graph.msg_or_end_deps.get(self.node.id())
    }

    pub fn node_status(&self) -> &NodeStatusTable {
        &self.run.status
    }

    pub fn chains(&self) -> &Chains {
        &self.run.chains
    }

    pub fn built_nodes(&self) -> &NodeArena {
        &self.run.graph.nodes
    }

    /// Inputs of the current run (item inputs inside an iteration)
    pub fn run_inputs(&self) -> &ValueMap {
        &self.run.inputs
    }

    pub fn config(&self) -> &EngineConfig {
        &self.run.config
    }

    /// Whether every chain containing this node has been deactivated
    pub fn is_not_run(&self) -> bool {
        self.run
            .status
            .get(self.node.id())
            .is_ok_and(|status| status.not_run.is_set())
    }

    /// Wait for every earlier output node on this node's chains
    ///
    /// Returns `false` if this node was logically skipped meanwhile.
    pub async fn await_output_dependencies(&self) -> bool {
        let Some(deps) = self.own_deps() else {
            return !self.is_not_run();
        };
        for dep in &deps.node_dep {
            if !self.run.owns(dep) {
                continue;
            }
            if let Ok(status) = self.run.status.get(dep) {
                status.complete.wait().await;
            }
            if self.is_not_run() {
                return false;
            }
        }
        !self.is_not_run()
    }

    /// Resolve one declared input, forwarding a streaming producer's
    /// fragments as they arrive
    ///
    /// Inputs without a live stream resolve straight from the variable pool.
    /// A producer that was logically skipped resolves to `null`, as does any
    /// input of a node skipped while it waited.
    pub async fn resolve_streamed_input<F>(&self, key: &str, mut on_fragment: F) -> Result<Value>
    where
        F: FnMut(&str) + Send,
    {
        let pool = &self.run.variable_pool;
        let Some(InputValue::Ref { node_id: producer, name }) =
            pool.input(self.node.id(), key).map(|input| &input.value)
        else {
            return pool.get_variable(self.node.id(), key).await;
        };

        let producer_status = self.run.status.get(producer)?;
        if producer_status.not_run.is_set() {
            return Ok(Value::Null);
        }
        let Some(queue) = pool.stream_queue(self.node.id(), producer) else {
            producer_status.complete.wait().await;
            if producer_status.not_run.is_set() || self.is_not_run() {
                return Ok(Value::Null);
            }
            return pool.get_variable(self.node.id(), key).await;
        };

        let timeout = self.run.config.stream_queue_timeout();
        let mut streamed = String::new();
        loop {
            tokio::select! {
                biased;
                frame = queue.get(timeout) => {
                    let frame = frame?;
                    if frame.exception_occurred {
                        break;
                    }
                    if !frame.content.is_empty() {
                        on_fragment(&frame.content);
                        streamed.push_str(&frame.content);
                    }
                    if frame.finished {
                        break;
                    }
                }
                _ = producer_status.complete.wait() => {
                    while let Some(frame) = queue.try_get() {
                        if !frame.exception_occurred && !frame.content.is_empty() {
                            on_fragment(&frame.content);
                            streamed.push_str(&frame.content);
                        }
                    }
                    break;
                }
            }
        }

        producer_status.complete.wait().await;
        if producer_status.not_run.is_set() || self.is_not_run() {
            return Ok(Value::Null);
        }
        match pool.get_output(producer, name).await {
            Some(value) => Ok(value),
            None => Ok(Value::String(streamed)),
        }
    }

    /// Run the nested engine of an iteration node once
    pub async fn run_iteration(
        &self,
        iteration_node_id: &str,
        inputs: ValueMap,
    ) -> Result<NodeRunResult> {
        crate::engine::run_nested(self.run, iteration_node_id, inputs).await
    }

    /// Wait for an external answer addressed to this node
    pub async fn wait_for_answer(&self, timeout: Option<Duration>) -> Result<Value> {
        let timeout = timeout.unwrap_or_else(|| self.run.config.interactive_answer_timeout());
        self.run
            .variable_pool
            .wait_for_answer(self.node.id(), timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_drain_collects_results_and_nested_spawns() {
        let registry = Arc::new(TaskRegistry::default());
        let counter = Arc::new(AtomicUsize::new(0));

        let inner_registry = registry.clone();
        let inner_counter = counter.clone();
        registry.spawn(move |_| {
            Box::pin(async move {
                inner_counter.fetch_add(1, Ordering::SeqCst);
                let counter = inner_counter.clone();
                inner_registry.spawn(move |_| {
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(Some(NodeRunResult::succeeded("node-end::1", "end")))
                    })
                });
                Ok(None)
            })
        });

        let (results, error) = registry.drain().await;
        assert!(error.is_none());
        assert_eq!(results.len(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_first_error_cancels_remaining_tasks() {
        let registry = TaskRegistry::default();
        registry.spawn(|_| Box::pin(async { Err(EngineError::run("boom")) }));
        registry.spawn(|_| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(None)
            })
        });

        let (_, error) = tokio::time::timeout(Duration::from_secs(5), registry.drain())
            .await
            .expect("drain must not wait for cancelled tasks");
        assert!(matches!(error, Some(EngineError::Run(_))));
        assert!(registry.is_cancelled());
    }

    #[tokio::test]
    async fn test_spawn_after_cancel_is_aborted() {
        let registry = TaskRegistry::default();
        registry.cancel_all_except(None);
        registry.spawn(|_| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Some(NodeRunResult::succeeded("node-end::1", "end")))
            })
        });
        let (results, error) = registry.drain().await;
        assert!(results.is_empty());
        assert!(error.is_none());
    }
}
