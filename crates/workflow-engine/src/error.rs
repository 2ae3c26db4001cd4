//! Error types for the workflow engine
//!
//! The variants follow the engine's failure taxonomy: timeouts and hard
//! interrupts are never retried, business errors are retryable up to the
//! node's retry bound, build errors never reach run time, and anything else
//! is wrapped into a node-run error.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Numeric error codes carried by [`NodeErrorInfo`] and callback events
pub mod codes {
    pub const SUCCESS: i32 = 0;
    pub const ENGINE_BUILD_ERROR: i32 = 20100;
    pub const ENGINE_RUN_ERROR: i32 = 20101;
    pub const NODE_RUN_ERROR: i32 = 20102;
    pub const NODE_TIMEOUT: i32 = 20103;
    pub const NODE_INTERRUPTED: i32 = 20104;
    pub const NODE_TYPE_UNSUPPORTED: i32 = 20105;
    pub const VARIABLE_POOL_ERROR: i32 = 20106;
    pub const STREAM_STALLED: i32 = 20107;
    pub const CACHE_ERROR: i32 = 20108;
    pub const CONFIG_ERROR: i32 = 20109;
}

/// Errors that can occur while building or running a workflow
#[derive(Debug, Error)]
pub enum EngineError {
    /// Node execution exceeded its allotted time
    #[error("Node '{node_id}' timed out after {timeout:?}")]
    Timeout { node_id: String, timeout: Duration },

    /// User or system abort
    #[error("Interrupted ({code}): {message}")]
    Interrupted { code: i32, message: String },

    /// Retryable business failure raised by a node
    #[error("Business error ({code}): {message}")]
    Business { code: i32, message: String },

    /// Graph inconsistency found while compiling
    #[error("Build error: {0}")]
    Build(String),

    /// Node type tag with no registered factory
    #[error("Current workflow does not support node type: {0}")]
    UnsupportedNodeType(String),

    /// Generic node failure
    #[error("Node '{node_id}' failed: {message}")]
    NodeRun { node_id: String, message: String },

    /// Branch node returned a selector with no matching edge
    #[error("Branch not found for node '{node_id}': {label}")]
    BranchNotFound { node_id: String, label: String },

    /// Scheduler-level failure
    #[error("Engine run error: {0}")]
    Run(String),

    /// The run finished without any terminal node producing a result
    #[error("End node did not return result")]
    NoTerminalResult,

    /// Variable pool lookup or update failed
    #[error("Variable pool error: {0}")]
    VariablePool(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration could not be loaded or saved
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Create a retryable business error
    pub fn business(code: i32, message: impl Into<String>) -> Self {
        Self::Business {
            code,
            message: message.into(),
        }
    }

    /// Create a hard interrupt with the default interrupt code
    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::Interrupted {
            code: codes::NODE_INTERRUPTED,
            message: message.into(),
        }
    }

    /// Create a generic node-run error
    pub fn node_run(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeRun {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    /// Create a scheduler-level run error
    pub fn run(message: impl Into<String>) -> Self {
        Self::Run(message.into())
    }

    /// Create a build error
    pub fn build(message: impl Into<String>) -> Self {
        Self::Build(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }

    pub fn is_business(&self) -> bool {
        matches!(self, Self::Business { .. })
    }

    /// Numeric code reported to callbacks and embedded in fallback results
    pub fn code(&self) -> i32 {
        match self {
            Self::Timeout { .. } => codes::NODE_TIMEOUT,
            Self::Interrupted { code, .. } | Self::Business { code, .. } => *code,
            Self::Build(_) => codes::ENGINE_BUILD_ERROR,
            Self::UnsupportedNodeType(_) => codes::NODE_TYPE_UNSUPPORTED,
            Self::NodeRun { .. } => codes::NODE_RUN_ERROR,
            Self::BranchNotFound { .. } | Self::Run(_) | Self::NoTerminalResult => {
                codes::ENGINE_RUN_ERROR
            }
            Self::VariablePool(_) => codes::VARIABLE_POOL_ERROR,
            Self::Serialization(_) | Self::Compression(_) => codes::CACHE_ERROR,
            Self::Config(_) | Self::Io(_) => codes::CONFIG_ERROR,
        }
    }

    /// The human-readable part of the error, without the variant prefix
    pub fn message(&self) -> String {
        match self {
            Self::Interrupted { message, .. }
            | Self::Business { message, .. }
            | Self::NodeRun { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Serializable view of this error
    pub fn to_info(&self) -> NodeErrorInfo {
        NodeErrorInfo {
            code: self.code(),
            message: self.message(),
        }
    }
}

/// Serializable error shape embedded in results and events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeErrorInfo {
    pub code: i32,
    pub message: String,
}

impl NodeErrorInfo {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Turn a reported failure back into a retryable error
    pub fn into_business(self) -> EngineError {
        EngineError::Business {
            code: self.code,
            message: self.message,
        }
    }
}

impl From<&EngineError> for NodeErrorInfo {
    fn from(err: &EngineError) -> Self {
        err.to_info()
    }
}
