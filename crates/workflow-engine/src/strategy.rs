//! Node execution strategies
//!
//! A strategy decides how one attempt of a node is entered. Most nodes run
//! directly; interactive nodes serialize behind the run-wide lock so only
//! one prompt is outstanding at a time.
//!
//! The strategy also decides which clock bounds an attempt. Interactive
//! nodes wait on a person, so only the configured answer timeout applies
//! to them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::context::RunContext;
use crate::error::Result;
use crate::node::EngineNode;
use crate::types::{NodeKind, NodeRunResult};

/// How one attempt of a node is executed
#[async_trait]
pub trait NodeExecutionStrategy: Send + Sync {
    /// Whether this strategy applies to the given kind
    fn can_handle(&self, kind: &NodeKind) -> bool;

    /// Bound on one attempt; `None` leaves the attempt to its own waits
    fn attempt_timeout(&self, node: &EngineNode, config: &EngineConfig) -> Option<Duration> {
        Some(node.retry_config().timeout_or(config.default_node_timeout()))
    }

    async fn execute_node(&self, node: &EngineNode, run: &Arc<RunContext>)
        -> Result<NodeRunResult>;
}

/// Marks the node processing and runs it
#[derive(Debug, Default)]
pub struct DefaultStrategy;

#[async_trait]
impl NodeExecutionStrategy for DefaultStrategy {
    fn can_handle(&self, _kind: &NodeKind) -> bool {
        true
    }

    async fn execute_node(
        &self,
        node: &EngineNode,
        run: &Arc<RunContext>,
    ) -> Result<NodeRunResult> {
        run.status.get(node.id())?.processing.set();
        node.invoke(run).await
    }
}

/// Holds the interactive lock for the whole attempt
#[derive(Debug, Default)]
pub struct InteractiveNodeStrategy {
    inner: DefaultStrategy,
}

#[async_trait]
impl NodeExecutionStrategy for InteractiveNodeStrategy {
    fn can_handle(&self, kind: &NodeKind) -> bool {
        kind.is_interactive()
    }

    fn attempt_timeout(&self, _node: &EngineNode, _config: &EngineConfig) -> Option<Duration> {
        None
    }

    async fn execute_node(
        &self,
        node: &EngineNode,
        run: &Arc<RunContext>,
    ) -> Result<NodeRunResult> {
        let _guard = run.interactive_lock.lock().await;
        log::debug!("Node {} acquired the interactive lock", node.id());
        self.inner.execute_node(node, run).await
    }
}

/// Ordered strategy list; the first that can handle a kind wins
pub struct StrategySelector {
    strategies: Vec<Box<dyn NodeExecutionStrategy>>,
}

impl StrategySelector {
    pub fn new() -> Self {
        Self {
            strategies: vec![
                Box::new(InteractiveNodeStrategy::default()),
                Box::new(DefaultStrategy),
            ],
        }
    }

    pub fn get_strategy(&self, kind: &NodeKind) -> &dyn NodeExecutionStrategy {
        self.strategies
            .iter()
            .find(|strategy| strategy.can_handle(kind))
            .map(Box::as_ref)
            .unwrap_or(&DefaultStrategy)
    }
}

impl Default for StrategySelector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interactive_kinds_use_locking_strategy() {
        let selector = StrategySelector::new();
        assert!(selector
            .get_strategy(&NodeKind::QuestionAnswer)
            .can_handle(&NodeKind::QuestionAnswer));
        assert!(!selector.get_strategy(&NodeKind::Llm).can_handle(&NodeKind::QuestionAnswer));
        assert!(selector
            .get_strategy(&NodeKind::Other("rpa".into()))
            .can_handle(&NodeKind::Start));
    }

    #[test]
    fn test_interactive_attempts_have_no_node_timeout() {
        use crate::node::WorkflowNode;
        use crate::types::{NodeDescription, RetryConfig};

        struct Noop;

        #[async_trait]
        impl WorkflowNode for Noop {
            async fn execute(
                &self,
                ctx: &crate::context::NodeContext<'_>,
            ) -> Result<NodeRunResult> {
                Ok(NodeRunResult::succeeded(ctx.node_id(), ctx.alias_name()))
            }
        }

        let config = EngineConfig {
            default_node_timeout_ms: 50,
            ..EngineConfig::default()
        };
        let selector = StrategySelector::new();

        let question = EngineNode::new(
            NodeDescription::new("question-answer::1", "ask"),
            Arc::new(Noop),
        );
        assert_eq!(
            selector
                .get_strategy(question.kind())
                .attempt_timeout(&question, &config),
            None
        );

        let code = EngineNode::new(
            NodeDescription::new("ifly-code::1", "code").with_retry(
                RetryConfig::default().with_timeout(Duration::from_secs(2)),
            ),
            Arc::new(Noop),
        );
        assert_eq!(
            selector.get_strategy(code.kind()).attempt_timeout(&code, &config),
            Some(Duration::from_secs(2))
        );
        let llm = EngineNode::new(NodeDescription::new("spark-llm::1", "llm"), Arc::new(Noop));
        assert_eq!(
            selector.get_strategy(llm.kind()).attempt_timeout(&llm, &config),
            Some(Duration::from_millis(50))
        );
    }
}
