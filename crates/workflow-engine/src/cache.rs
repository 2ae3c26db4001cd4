//! Compiled-engine cache
//!
//! An engine is stored as a versioned [`EngineSnapshot`]: the description,
//! the enumerated chains and the dependency map, serialized as JSON and
//! compressed with zstd. Live signals, node instances and run state are
//! never stored; restoring re-instantiates nodes through the registry.
//!
//! Restoring never fails loudly. Any problem is logged and reported as a
//! cache miss so the caller rebuilds from the description.

use serde::{Deserialize, Serialize};

use crate::builder::assemble;
use crate::chains::{Chains, ChainsSnapshot};
use crate::config::EngineConfig;
use crate::constants::SNAPSHOT_VERSION;
use crate::deps::MsgOrEndDeps;
use crate::engine::WorkflowEngine;
use crate::error::{EngineError, Result};
use crate::registry::NodeRegistry;
use crate::types::WorkflowDescription;

/// Plain-data form of a compiled engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub version: u32,
    /// Milliseconds since epoch
    pub build_timestamp: i64,
    pub description: WorkflowDescription,
    pub chains: ChainsSnapshot,
    pub msg_or_end_deps: MsgOrEndDeps,
}

impl EngineSnapshot {
    pub fn of(engine: &WorkflowEngine) -> Self {
        let graph = engine.graph();
        Self {
            version: SNAPSHOT_VERSION,
            build_timestamp: graph.build_timestamp(),
            description: graph.description().clone(),
            chains: graph.chains().to_snapshot(),
            msg_or_end_deps: graph.msg_or_end_deps().clone(),
        }
    }

    pub fn encode(&self, level: i32) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        zstd::encode_all(&json[..], level).map_err(|e| EngineError::Compression(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let json = zstd::decode_all(bytes).map_err(|e| EngineError::Compression(e.to_string()))?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// Serialize an engine to an opaque blob
pub fn dumps(engine: &WorkflowEngine) -> Result<Vec<u8>> {
    EngineSnapshot::of(engine).encode(engine.config().cache_compression_level)
}

/// Restore an engine; `None` means a cache miss
pub fn loads(bytes: &[u8], registry: &NodeRegistry, config: EngineConfig) -> Option<WorkflowEngine> {
    match restore(bytes, registry, config, None) {
        Ok(engine) => Some(engine),
        Err(e) => {
            log::warn!("Engine cache miss: {}", e);
            None
        }
    }
}

/// Restore an engine unless it was built before `updated_at` (ms since epoch)
pub fn loads_if_fresh(
    bytes: &[u8],
    registry: &NodeRegistry,
    config: EngineConfig,
    updated_at: i64,
) -> Option<WorkflowEngine> {
    match restore(bytes, registry, config, Some(updated_at)) {
        Ok(engine) => Some(engine),
        Err(e) => {
            log::warn!("Engine cache miss: {}", e);
            None
        }
    }
}

fn restore(
    bytes: &[u8],
    registry: &NodeRegistry,
    config: EngineConfig,
    updated_at: Option<i64>,
) -> Result<WorkflowEngine> {
    let snapshot = EngineSnapshot::decode(bytes)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(EngineError::Compression(format!(
            "Snapshot version {} does not match {}",
            snapshot.version, SNAPSHOT_VERSION
        )));
    }
    if let Some(updated_at) = updated_at {
        if snapshot.build_timestamp < updated_at {
            return Err(EngineError::Compression(format!(
                "Snapshot built at {} is older than workflow update at {}",
                snapshot.build_timestamp, updated_at
            )));
        }
    }

    assemble(
        snapshot.description,
        registry,
        config,
        Chains::from_snapshot(snapshot.chains),
        snapshot.msg_or_end_deps,
        snapshot.build_timestamp,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::builder::EngineBuilder;
    use crate::context::NodeContext;
    use crate::node::WorkflowNode;
    use crate::types::{EdgeDescription, NodeDescription, NodeRunResult};

    struct Noop;

    #[async_trait]
    impl WorkflowNode for Noop {
        async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeRunResult> {
            Ok(NodeRunResult::succeeded(ctx.node_id(), ctx.alias_name()))
        }
    }

    fn registry() -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        registry.register_fn("node-start", |_| Ok(Arc::new(Noop)));
        registry.register_fn("node-end", |_| Ok(Arc::new(Noop)));
        registry
    }

    fn engine() -> WorkflowEngine {
        let mut desc = WorkflowDescription::new("cached");
        desc.nodes = vec![
            NodeDescription::new("node-start::1", "start"),
            NodeDescription::new("node-end::1", "end"),
        ];
        desc.edges = vec![EdgeDescription::new("node-start::1", "node-end::1")];
        EngineBuilder::new(desc, &registry()).build().unwrap()
    }

    #[test]
    fn test_dumps_and_loads() {
        let engine = engine();
        let bytes = dumps(&engine).unwrap();
        let restored = loads(&bytes, &registry(), EngineConfig::default()).unwrap();

        assert_eq!(
            EngineSnapshot::of(&restored),
            EngineSnapshot::of(&engine)
        );
        assert_eq!(restored.graph().nodes().len(), 2);
    }

    #[test]
    fn test_garbage_is_a_miss() {
        assert!(loads(b"not zstd", &registry(), EngineConfig::default()).is_none());
    }

    #[test]
    fn test_missing_node_type_is_a_miss() {
        let bytes = dumps(&engine()).unwrap();
        assert!(loads(&bytes, &NodeRegistry::new(), EngineConfig::default()).is_none());
    }

    #[test]
    fn test_stale_snapshot_is_a_miss() {
        let engine = engine();
        let bytes = dumps(&engine).unwrap();
        let built = engine.graph().build_timestamp();

        assert!(loads_if_fresh(&bytes, &registry(), EngineConfig::default(), built).is_some());
        assert!(loads_if_fresh(&bytes, &registry(), EngineConfig::default(), built + 1).is_none());
    }

    #[test]
    fn test_version_mismatch_is_a_miss() {
        let mut snapshot = EngineSnapshot::of(&engine());
        snapshot.version += 1;
        let bytes = snapshot.encode(3).unwrap();
        assert!(loads(&bytes, &registry(), EngineConfig::default()).is_none());
    }
}
