//! Workflow Engine - concurrent DAG scheduler for declarative workflows
//!
//! Compiles a flat node/edge description into a graph of typed nodes and
//! runs it with one lightweight task per reachable node. It supports:
//!
//! - Branch selection from node results (decision, if/else, option questions)
//! - Path deactivation and logical "not run" propagation
//! - Per-node timeout, retry and fallback policies (custom return, fail branch)
//! - Streaming fan-out from producer nodes to message/end nodes
//! - Serialized execution of interactive nodes
//! - Nested iteration sub-graphs
//! - Versioned, compressed engine snapshots for caching
//!
//! # Architecture
//!
//! - [`EngineBuilder`] validates the description and produces a
//!   [`WorkflowEngine`] holding the immutable [`CompiledGraph`]
//! - Each run owns fresh [`status`] signals and chain flags
//! - Nodes implement [`WorkflowNode`] and are created through a
//!   [`NodeRegistry`]
//! - Progress is reported through an [`EventSink`]
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use workflow_engine::{EngineBuilder, NodeRegistry, NullEventSink, RunRequest};
//!
//! let mut registry = NodeRegistry::new();
//! workflow_nodes::register_builtins(&mut registry);
//!
//! let engine = EngineBuilder::new(description, &registry).build()?;
//! let result = engine
//!     .run(RunRequest::new(inputs), Arc::new(NullEventSink))
//!     .await?;
//! ```

pub mod builder;
pub mod cache;
pub mod chains;
pub mod config;
pub mod constants;
pub mod context;
pub mod deps;
pub mod engine;
pub mod error;
pub mod error_chain;
pub mod event_log;
pub mod events;
pub mod node;
pub mod registry;
pub mod status;
pub mod strategy;
pub mod types;
pub mod variable_pool;

// Re-export key types
pub use builder::{CompiledGraph, EngineBuilder, IterationEngine};
pub use cache::EngineSnapshot;
pub use chains::{Chains, SimplePath};
pub use config::EngineConfig;
pub use context::{NodeContext, RunContext};
pub use deps::{MsgOrEndDepInfo, MsgOrEndDeps};
pub use engine::{RunOutcome, RunRequest, WorkflowEngine, WorkflowRun};
pub use error::{EngineError, NodeErrorInfo, Result};
pub use event_log::{EventLog, NodeLog};
pub use events::{
    ChannelEventSink, EventError, EventSink, NullEventSink, VecEventSink, WorkflowCallbacks,
    WorkflowEvent,
};
pub use node::{EngineNode, NodeArena, WorkflowNode};
pub use registry::{NodeFactory, NodeRegistry};
pub use status::{NodeRunningStatus, NodeState, NodeStatusTable, Signal};
pub use types::{
    ChatMessage, EdgeDescription, ErrorStrategy, HistoryEntry, InputValue, NodeDescription,
    NodeExecutionStatus, NodeId, NodeInput, NodeKind, NodeRunResult, RetryConfig, ValueMap,
    WorkflowDescription,
};
pub use variable_pool::{StreamFrame, StreamQueue, VariablePool};
