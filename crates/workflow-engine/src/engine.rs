//! Depth-first concurrent scheduler
//!
//! A run starts at the start node and launches one task per newly reachable
//! node. Each task waits for the immediate predecessors on its still-active
//! chains, executes the node under its timeout and error policy, selects
//! the next nodes, deactivates the chains of the alternatives it did not
//! take and launches the selected successors.
//!
//! Output nodes that read a producer's data are pre-launched when the
//! producer starts so they can forward its stream while it is generated.
//! Start nodes never pre-launch. Whichever of the pre-launch and the
//! regular traversal claims a node's `processing` signal first executes
//! it; the other only routes. A pre-launched node spends most of its life
//! waiting on its producer, so it runs without the per-node timeout.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;

use crate::builder::CompiledGraph;
use crate::chains::Chains;
use crate::config::EngineConfig;
use crate::context::{CancelOnDrop, RunContext, SharedRunState, TaskFuture, TaskOutput};
use crate::error::{codes, EngineError, NodeErrorInfo, Result};
use crate::error_chain::{ErrorHandlerChain, HandlerOutcome};
use crate::event_log::{EventLog, NodeLog};
use crate::events::{EventSink, WorkflowCallbacks};
use crate::node::EngineNode;
use crate::status::{NodeRunningStatus, NodeState};
use crate::strategy::StrategySelector;
use crate::types::{
    ErrorStrategy, HistoryEntry, NodeExecutionStatus, NodeId, NodeKind, NodeRunResult, ValueMap,
};
use crate::variable_pool::VariablePool;

/// Inputs of one run
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Exposed as the start node's outputs
    pub inputs: ValueMap,
    /// Prior conversation, per node
    pub history: Vec<HistoryEntry>,
}

impl RunRequest {
    pub fn new(inputs: ValueMap) -> Self {
        Self {
            inputs,
            history: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<HistoryEntry>) -> Self {
        self.history = history;
        self
    }
}

/// Terminal result plus the run's observable trace
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub execution_id: String,
    pub result: NodeRunResult,
    pub node_states: BTreeMap<NodeId, NodeState>,
    pub node_logs: Vec<NodeLog>,
}

/// A compiled workflow, reusable across runs
pub struct WorkflowEngine {
    graph: Arc<CompiledGraph>,
    config: Arc<EngineConfig>,
    strategies: Arc<StrategySelector>,
    error_chain: Arc<ErrorHandlerChain>,
}

impl WorkflowEngine {
    pub(crate) fn new(graph: CompiledGraph, config: EngineConfig) -> Self {
        Self {
            graph: Arc::new(graph),
            config: Arc::new(config),
            strategies: Arc::new(StrategySelector::new()),
            error_chain: Arc::new(ErrorHandlerChain::new()),
        }
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Prepare a run without starting it
    ///
    /// The returned handle exposes the run's variable pool, so answers for
    /// interactive nodes can be submitted while the run executes.
    pub fn start(&self, request: RunRequest, sink: Arc<dyn EventSink>) -> WorkflowRun {
        let execution_id = format!("wf-exec-{}", uuid::Uuid::new_v4());
        let shared = SharedRunState {
            execution_id: execution_id.clone(),
            variable_pool: Arc::new(VariablePool::new(&self.graph.description)),
            callbacks: WorkflowCallbacks::new(sink, &self.graph.description.id, &execution_id),
            event_log: Arc::new(EventLog::new()),
            interactive_lock: Arc::new(tokio::sync::Mutex::new(())),
            strategies: self.strategies.clone(),
            error_chain: self.error_chain.clone(),
            config: self.config.clone(),
        };
        let run = RunContext::new(
            self.graph.clone(),
            self.graph.chains.fresh(),
            self.graph.start_node_id.clone(),
            request.inputs,
            shared,
        );
        WorkflowRun {
            run: Arc::new(run),
            history: request.history,
        }
    }

    /// Run to completion and return the terminal result
    pub async fn run(&self, request: RunRequest, sink: Arc<dyn EventSink>) -> Result<NodeRunResult> {
        self.start(request, sink)
            .execute()
            .await
            .map(|outcome| outcome.result)
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflow_id", &self.graph.description.id)
            .field("nodes", &self.graph.nodes.len())
            .field("build_timestamp", &self.graph.build_timestamp)
            .finish()
    }
}

/// A prepared run
pub struct WorkflowRun {
    run: Arc<RunContext>,
    history: Vec<HistoryEntry>,
}

impl WorkflowRun {
    pub fn execution_id(&self) -> &str {
        &self.run.execution_id
    }

    /// Shared variable pool of the run
    pub fn variable_pool(&self) -> Arc<VariablePool> {
        self.run.variable_pool.clone()
    }

    /// Execute the run; dropping the future cancels every task it launched
    pub async fn execute(self) -> Result<RunOutcome> {
        let run = self.run;
        let _cancel = CancelOnDrop(run.clone());

        let pool = &run.variable_pool;
        pool.set_run_inputs(&run.inputs).await;
        for entry in self.history {
            pool.add_history(&entry.node_id, entry.chat_history).await;
        }
        for (consumer, info) in &run.graph.msg_or_end_deps {
            for producer in &info.data_dep {
                if NodeKind::of(producer).streams_output() {
                    pool.register_stream(consumer, producer);
                }
            }
        }

        log::info!(
            "[{}] Running workflow {}",
            run.execution_id,
            run.graph.description.id
        );
        run.callbacks.on_sparkflow_start();

        let outcome = traverse(&run).await;
        run.callbacks.on_sparkflow_end(&outcome);

        match &outcome {
            Ok(result) => log::info!(
                "[{}] Workflow finished at {}",
                run.execution_id,
                result.node_id
            ),
            Err(e) => log::warn!("[{}] Workflow failed: {}", run.execution_id, e),
        }

        outcome.map(|result| RunOutcome {
            execution_id: run.execution_id.clone(),
            result,
            node_states: run.status.states(),
            node_logs: run.event_log.entries(),
        })
    }
}

/// Run an iteration node's sub-graph once with the given item inputs
pub(crate) async fn run_nested(
    parent: &Arc<RunContext>,
    iteration_node_id: &str,
    inputs: ValueMap,
) -> Result<NodeRunResult> {
    let entry = parent
        .graph
        .iteration_engines
        .get(iteration_node_id)
        .ok_or_else(|| {
            EngineError::run(format!(
                "Iteration node {} has no nested engine",
                iteration_node_id
            ))
        })?;
    let chains = parent
        .graph
        .chains
        .for_iteration(iteration_node_id)
        .map(Chains::fresh)
        .ok_or_else(|| {
            EngineError::run(format!(
                "Iteration node {} has no chains",
                iteration_node_id
            ))
        })?;

    let run = Arc::new(RunContext::new(
        parent.graph.clone(),
        chains,
        entry.entry_node_id.clone(),
        inputs,
        parent.shared(),
    ));
    let _cancel = CancelOnDrop(run.clone());
    reset_body_streams(&run);
    traverse(&run).await
}

/// Give the body's streaming producers an unsent first token and their
/// consumers empty queues
///
/// Items run one after another, so no earlier item is still reading.
fn reset_body_streams(run: &RunContext) {
    let pool = &run.variable_pool;
    for node_id in run.graph.nodes.ids() {
        if NodeKind::of(node_id).streams_output() && run.owns(node_id) {
            pool.reset_first_token(node_id);
        }
    }
    for (consumer, info) in &run.graph.msg_or_end_deps {
        if !run.owns(consumer) {
            continue;
        }
        for producer in &info.data_dep {
            if NodeKind::of(producer).streams_output() && run.owns(producer) {
                pool.reset_stream(consumer, producer);
            }
        }
    }
}

/// Traverse from the run's root and collect its terminal result
async fn traverse(run: &Arc<RunContext>) -> Result<NodeRunResult> {
    let root = run.graph.nodes.get(&run.root)?;
    if !root.kind().is_start() {
        return Err(EngineError::run(format!(
            "Traversal root {} is not a start node",
            run.root
        )));
    }
    for (key, value) in &run.inputs {
        run.variable_pool
            .set_output(&run.root, key, value.clone())
            .await;
    }

    let root_outcome = visit(run.clone(), run.root.clone(), None).await;
    let (prelaunched, task_error) = run.tasks.drain().await;

    root_outcome?;
    if let Some(error) = task_error {
        return Err(error);
    }
    if !run.end_complete.is_set() {
        log::warn!(
            "[{}] All tasks finished without reaching a leaf",
            run.execution_id
        );
    }

    let mut results = std::mem::take(&mut *run.responses.lock());
    results.extend(prelaunched);
    results.pop().ok_or(EngineError::NoTerminalResult)
}

/// Task body for one node; on failure cancels every sibling task
fn visit(run: Arc<RunContext>, node_id: NodeId, task_id: Option<u64>) -> TaskFuture {
    Box::pin(visit_task(run, node_id, task_id))
}

async fn visit_task(run: Arc<RunContext>, node_id: NodeId, task_id: Option<u64>) -> TaskOutput {
    if let Err(e) = visit_node(&run, &node_id).await {
        log::debug!(
            "[{}] Cancelling run after failure at {}",
            run.execution_id,
            node_id
        );
        run.tasks.cancel_all_except(task_id);
        run.end_complete.set();
        return Err(e);
    }
    Ok(None)
}

async fn visit_node(run: &Arc<RunContext>, node_id: &str) -> Result<()> {
    let node = run.graph.nodes.get(node_id)?;
    let status = run.status.get(node_id)?;

    if !node.kind().is_start() {
        wait_for_predecessors(run, node).await?;
        if status.not_run.is_set() || all_chains_inactive(run, node_id) {
            log::debug!("[{}] Node {} skipped", run.execution_id, node_id);
            return Ok(());
        }
    }

    let mut result = None;
    let mut fail_branch = false;
    let executed = match claim(status) {
        Claim::Execute => true,
        Claim::Route => false,
        Claim::Skip => {
            log::debug!("[{}] Node {} deactivated before start", run.execution_id, node_id);
            return Ok(());
        }
    };
    if executed {
        if !node.kind().is_start() {
            prelaunch_output_nodes(run, node_id)?;
        }
        if !node.kind().is_output() {
            run.callbacks.on_node_start(node_id, node.alias_name());
        }
        match execute_with_policy(run, node, true).await {
            Ok((node_result, via_fail)) => {
                result = Some(node_result);
                fail_branch = via_fail;
            }
            Err(e) => {
                status.mark_complete();
                return Err(e);
            }
        }
    }

    // Skipped targets are marked before completion wakes any consumer
    let routed = route(run, node, result.as_ref(), fail_branch);
    if executed {
        status.mark_complete();
    }
    let active = routed?;

    if active.is_empty() {
        if let Some(result) = result.filter(|r| node.kind().is_terminal() && r.is_success()) {
            run.push_response(result);
        }
        run.end_complete.set();
        return Ok(());
    }

    for target in active {
        if run.status.get(&target)?.start_with_thread.set() {
            let task_run = run.clone();
            run.tasks
                .spawn(move |task_id| visit(task_run, target, Some(task_id)));
        }
    }
    Ok(())
}

/// Who acts on a node reached by traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    /// This task runs the node
    Execute,
    /// A pre-launch runs it; this task only routes
    Route,
    /// Deactivated meanwhile; nothing to do
    Skip,
}

/// `mark_not_run` also sets `processing`, so a lost claim is checked for
/// deactivation before routing
fn claim(status: &NodeRunningStatus) -> Claim {
    if status.processing.set() {
        Claim::Execute
    } else if status.not_run.is_set() {
        Claim::Skip
    } else {
        Claim::Route
    }
}

/// Wait on the immediate predecessor of every active chain through `node`
///
/// Each wait is a race between the predecessor completing and the chain
/// being deactivated.
async fn wait_for_predecessors(run: &Arc<RunContext>, node: &EngineNode) -> Result<()> {
    let waits = run
        .chains
        .get_node_chains(node.id())
        .into_iter()
        .filter(|chain| !chain.is_inactive())
        .filter_map(|chain| {
            let pred = chain.predecessor_of(node.id())?;
            node.previous()
                .iter()
                .any(|p| p == pred)
                .then_some((chain, pred))
        })
        .map(|(chain, pred)| async move {
            let pred_status = run.status.get(pred)?;
            tokio::select! {
                _ = pred_status.complete.wait() => {}
                _ = chain.inactive().wait() => {}
            }
            Ok::<(), EngineError>(())
        });

    for outcome in join_all(waits).await {
        outcome?;
    }
    Ok(())
}

fn all_chains_inactive(run: &RunContext, node_id: &str) -> bool {
    let chains = run.chains.get_node_chains(node_id);
    !chains.is_empty() && chains.iter().all(|chain| chain.is_inactive())
}

/// Launch message/terminal nodes that read `producer`'s output
fn prelaunch_output_nodes(run: &Arc<RunContext>, producer: &str) -> Result<()> {
    for (consumer, info) in &run.graph.msg_or_end_deps {
        if !info.depends_on_data(producer)
            || !info.has_normal_path_from(producer)
            || !run.owns(consumer)
        {
            continue;
        }
        let status = run.status.get(consumer)?;
        if status.not_run.is_set() || !status.processing.set() {
            continue;
        }
        status.pre_processing.set();
        log::debug!(
            "[{}] Pre-launching {} for producer {}",
            run.execution_id,
            consumer,
            producer
        );

        let task_run = run.clone();
        let consumer = consumer.clone();
        run.tasks
            .spawn(move |task_id| prelaunch(task_run, consumer, task_id));
    }
    Ok(())
}

fn prelaunch(run: Arc<RunContext>, node_id: NodeId, task_id: u64) -> TaskFuture {
    Box::pin(prelaunch_task(run, node_id, task_id))
}

async fn prelaunch_task(run: Arc<RunContext>, node_id: NodeId, task_id: u64) -> TaskOutput {
    let outcome = execute_prelaunched(&run, &node_id).await;
    if outcome.is_err() {
        run.tasks.cancel_all_except(Some(task_id));
        run.end_complete.set();
    }
    outcome
}

async fn execute_prelaunched(run: &Arc<RunContext>, node_id: &str) -> TaskOutput {
    let node = run.graph.nodes.get(node_id)?;
    let status = run.status.get(node_id)?;
    let outcome = execute_with_policy(run, node, false).await;
    status.mark_complete();
    let (result, _) = outcome?;
    let answers = node.kind().is_terminal() && result.is_success() && !status.not_run.is_set();
    Ok(answers.then_some(result))
}

/// Execute one node, retrying as the error chain decides
///
/// With `timed` each attempt is bounded by the timeout its strategy picks.
/// Returns the result and whether it routes through the failure edges.
async fn execute_with_policy(
    run: &Arc<RunContext>,
    node: &EngineNode,
    timed: bool,
) -> Result<(NodeRunResult, bool)> {
    let fail_only = node.fail_only_targets();
    if node.kind().streams_output() && !fail_only.is_empty() {
        watch_first_token(run, node.id(), fail_only);
    }

    let retry = node.retry_config();
    let strategy = run.strategies.get_strategy(node.kind());
    let timeout = if timed {
        strategy.attempt_timeout(node, &run.config)
    } else {
        None
    };
    let mut attempt = 0;

    loop {
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, strategy.execute_node(node, run))
                .await
                .map_err(|_| limit),
            None => Ok(strategy.execute_node(node, run).await),
        };
        let error = match outcome {
            Ok(Ok(result)) if result.status == NodeExecutionStatus::Failed => result
                .error
                .unwrap_or_else(|| {
                    NodeErrorInfo::new(codes::NODE_RUN_ERROR, "Node reported failure")
                })
                .into_business(),
            Ok(Ok(result)) => return Ok((result, false)),
            Ok(Err(e)) => e,
            Err(timeout) => EngineError::Timeout {
                node_id: node.id().to_string(),
                timeout,
            },
        };

        match run.error_chain.handle(error, node, run, attempt).await {
            HandlerOutcome::Retry => attempt += 1,
            HandlerOutcome::Recovered(result) => {
                let fail_branch = retry.effective_strategy() == ErrorStrategy::FailBranch;
                return Ok((result, fail_branch));
            }
            HandlerOutcome::Abort(e) | HandlerOutcome::Pass(e) => return Err(e),
        }
    }
}

/// Once a streaming node sends its first token it can no longer be rerouted
/// to its failure targets
fn watch_first_token(run: &Arc<RunContext>, node_id: &str, fail_only: Vec<NodeId>) {
    let task_run = run.clone();
    let node_id = node_id.to_string();
    run.tasks
        .spawn(move |_| Box::pin(first_token_task(task_run, node_id, fail_only)));
}

async fn first_token_task(run: Arc<RunContext>, node_id: NodeId, fail_only: Vec<NodeId>) -> TaskOutput {
    let first_token = run.variable_pool.first_token_signal(&node_id);
    let status = run.status.get(&node_id)?;
    tokio::select! {
        biased;
        _ = first_token.wait() => {
            log::debug!(
                "[{}] Node {} started streaming, failure branch closed",
                run.execution_id,
                node_id
            );
            deactivate(&run, &node_id, &fail_only)?;
        }
        _ = status.complete.wait() => {}
    }
    Ok(None)
}

/// Pick the successors to run and deactivate the rest
fn route(
    run: &Arc<RunContext>,
    node: &EngineNode,
    result: Option<&NodeRunResult>,
    fail_branch: bool,
) -> Result<Vec<NodeId>> {
    let (active, inactive) = next_nodes(node, result, fail_branch)?;
    run.event_log.record_next(node.id(), &active);
    deactivate(run, node.id(), &inactive)?;
    Ok(active)
}

/// Split a node's successors into the ones to run and the ones to skip
fn next_nodes(
    node: &EngineNode,
    result: Option<&NodeRunResult>,
    fail_branch: bool,
) -> Result<(Vec<NodeId>, Vec<NodeId>)> {
    let (active, mut inactive): (Vec<NodeId>, Vec<NodeId>) = if fail_branch {
        let active = node.fail().to_vec();
        let inactive = node
            .next()
            .iter()
            .filter(|id| !active.contains(id))
            .cloned()
            .collect();
        (active, inactive)
    } else if node.is_branch_node() {
        let result = result.ok_or_else(|| {
            EngineError::node_run(node.id(), "Branch node did not return result")
        })?;
        let label = result.branch_selector();
        let targets = node
            .branch_targets(label)
            .or_else(|| match node.kind() {
                NodeKind::DecisionMaking => node.default_branch_targets(),
                _ => None,
            })
            .ok_or_else(|| EngineError::BranchNotFound {
                node_id: node.id().to_string(),
                label: label.to_string(),
            })?;
        let active = targets.to_vec();
        let inactive = node
            .next()
            .iter()
            .filter(|id| !active.contains(id))
            .cloned()
            .collect();
        (active, inactive)
    } else {
        (node.next().to_vec(), Vec::new())
    };

    for fail_target in node.fail() {
        if !active.contains(fail_target) && !inactive.contains(fail_target) {
            inactive.push(fail_target.clone());
        }
    }
    Ok((active, inactive))
}

/// Deactivate the chains from `from` into each target, then mark every
/// node left without an active chain as not run
fn deactivate(run: &RunContext, from: &str, targets: &[NodeId]) -> Result<()> {
    for target in targets {
        for chain in run.chains.get_branch_chains(from, target) {
            chain.deactivate();
        }
    }

    let mut pending: Vec<NodeId> = targets.to_vec();
    while let Some(node_id) = pending.pop() {
        if run
            .chains
            .get_node_chains(&node_id)
            .iter()
            .any(|chain| !chain.is_inactive())
        {
            continue;
        }
        let status = run.status.get(&node_id)?;
        if status.not_run.is_set() || status.complete.is_set() {
            continue;
        }
        status.mark_not_run();
        log::debug!("[{}] Node {} will not run", run.execution_id, node_id);

        if !NodeKind::of(&node_id).is_terminal() {
            pending.extend(run.chains.successors(&node_id).iter().cloned());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_by_traversal() {
        let status = NodeRunningStatus::default();
        assert_eq!(claim(&status), Claim::Execute);
        assert_eq!(claim(&status), Claim::Route);
    }

    #[test]
    fn test_claim_after_deactivation_is_a_skip() {
        let status = NodeRunningStatus::default();
        status.mark_not_run();
        assert_eq!(claim(&status), Claim::Skip);
    }

    #[test]
    fn test_claim_lost_to_prelaunch_then_deactivated() {
        let status = NodeRunningStatus::default();
        assert!(status.processing.set());
        assert_eq!(claim(&status), Claim::Route);
        status.mark_not_run();
        assert_eq!(claim(&status), Claim::Skip);
    }
}
