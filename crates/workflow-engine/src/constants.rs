//! Engine-wide constants
//!
//! Edge-handle markers and node-id conventions shared by the builder and
//! the scheduler, plus the default values used by [`crate::EngineConfig`].

/// Separator between a node's type tag and its unique suffix (`spark-llm::1a2b`)
pub const NODE_ID_DELIMITER: &str = "::";

/// Substring of an edge handle that marks a failure edge
pub const FAIL_HANDLE_MARKER: &str = "fail_one_of";

/// Prefix of labeled intent/branch edge handles (`intent_chain|<label>`)
pub const INTENT_HANDLE_PREFIX: &str = "intent_chain|";

/// Branch selector assumed when a result carries none
pub const DEFAULT_BRANCH_HANDLE: &str = "default_chain";

/// Name of the fallback intent declared on decision nodes
pub const DEFAULT_INTENT_NAME: &str = "default";

/// Question-answer `answerType` that turns the node into a branch node
pub const OPTION_ANSWER_TYPE: &str = "option";

/// Node parameter keys read by the builder
pub mod params {
    pub const INTENT_CHAINS: &str = "intentChains";
    pub const ANSWER_TYPE: &str = "answerType";
    pub const ITERATION_START_NODE_ID: &str = "iterationStartNodeId";
}

/// Keys written into `error_outputs` when a failure is resolved by fallback
pub mod error_outputs {
    pub const CODE: &str = "errorCode";
    pub const MESSAGE: &str = "errorMessage";
}

/// Default values for [`crate::EngineConfig`]
pub mod defaults {
    /// Per-node execution timeout when the retry policy declares none
    pub const NODE_TIMEOUT_MS: u64 = 60_000;
    /// Bounded wait on a streaming queue before the producer counts as stalled
    pub const STREAM_QUEUE_TIMEOUT_MS: u64 = 60_000;
    /// How long an interactive node waits for an external answer
    pub const INTERACTIVE_ANSWER_TIMEOUT_MS: u64 = 300_000;
    /// Upper bound on nodes in one compiled graph
    pub const MAX_NODES: usize = 1_000;
    /// Upper bound on enumerated root-to-terminal chains
    pub const MAX_CHAINS: usize = 10_000;
    /// zstd level for engine snapshots
    pub const CACHE_COMPRESSION_LEVEL: i32 = 3;
}

/// Format version of [`crate::cache::EngineSnapshot`]
pub const SNAPSHOT_VERSION: u32 = 1;
