// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Assembly and lifecycle of the orchestration core.
//!
//! The Environment owns every component: the notification queue, the key
//! store, the DAG store, the plugin table, and the option map actors read
//! through their `env` fd. There is no process-wide singleton; tests build
//! as many Environments as they like.
//!
//! Well-known aliases seeded at construction:
//!
//! | Alias | Meaning |
//! |-------|---------|
//! | `.prompt` | the prompt value nodes |
//! | `.chat_messages` | the conversation so far |
//! | `.toolspecs` | aggregate of the per-tool spec aliases |
//! | `.tools.<name>` | one tool's spec value node(s) |
//! | `.end` | the terminal node the driver waits on |

pub mod state;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::actors::tools::tool_spec;
use crate::errors::{GraphError, PipeError};
use crate::graph::{DagStore, NodeId, NodeState, SourceRef, WorkflowRegistry};
use crate::kv::KeyStore;
use crate::notify::NotificationQueue;
use crate::scheduler::Scheduler;

/// Runtime options visible to every actor through its `env` fd, rendered as
/// one flat JSON object.
pub struct EnvOpts {
    map: RwLock<serde_json::Map<String, Value>>,
}

impl EnvOpts {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(serde_json::Map::new()),
        }
    }

    pub fn set(&self, key: &str, value: Value) {
        self.map.write().insert(key.to_string(), value);
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.map
            .read()
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&Value::Object(self.map.read().clone()))
            .expect("option map serializes")
    }
}

impl Default for EnvOpts {
    fn default() -> Self {
        Self::new()
    }
}

/// The orchestration core, fully assembled.
pub struct Environment {
    pub queue: Arc<NotificationQueue>,
    pub kv: Arc<KeyStore>,
    pub dag: Arc<DagStore>,
    pub registry: Arc<WorkflowRegistry>,
    pub opts: Arc<EnvOpts>,
    cancel: CancellationToken,
}

impl Environment {
    pub fn new(registry: WorkflowRegistry) -> Self {
        let queue = Arc::new(NotificationQueue::new());
        let kv = Arc::new(KeyStore::new(Arc::clone(&queue)));
        let dag = Arc::new(DagStore::new(Arc::clone(&queue), Arc::clone(&kv)));

        for alias in [".prompt", ".chat_messages", ".toolspecs", ".end"] {
            dag.alias(alias, None).expect("seeding an empty alias");
        }

        Self {
            queue,
            kv,
            dag,
            registry: Arc::new(registry),
            opts: Arc::new(EnvOpts::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Add one prompt item as a value node under `.prompt`.
    pub fn add_prompt(&self, text: &str) -> Result<NodeId, GraphError> {
        let id = self.dag.add_value_node(text.as_bytes(), Some("prompt"))?;
        self.dag.alias(".prompt", Some(SourceRef::Node(id)))?;
        Ok(id)
    }

    /// Publish a built-in tool: its spec value node under `.tools.<name>`,
    /// aggregated into `.toolspecs`.
    pub fn register_tool(&self, name: &str) -> Result<(), GraphError> {
        let spec = tool_spec(name)
            .ok_or_else(|| GraphError::UnknownWorkflow(format!(".tools.{}", name)))?;
        let spec_bytes = serde_json::to_vec(&spec).expect("tool spec serializes");
        let node = self
            .dag
            .add_value_node(&spec_bytes, Some(&format!("tool spec {}", name)))?;

        let tool_alias = format!(".tools.{}", name);
        self.dag.alias(&tool_alias, Some(SourceRef::Node(node)))?;
        self.dag
            .alias(".toolspecs", Some(SourceRef::Alias(tool_alias)))?;
        Ok(())
    }

    /// Instantiate the main workflow and point `.end` at its sink.
    pub fn build_flow(&self, workflow: &str) -> Result<NodeId, GraphError> {
        let sink =
            self.dag
                .instantiate_with_deps(&self.registry, workflow, &HashMap::new())?;
        self.dag.realias(".end", SourceRef::Node(sink))?;
        Ok(sink)
    }

    /// A scheduler driving this environment.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.kv),
            Arc::clone(&self.dag),
            Arc::clone(&self.registry),
            Arc::clone(&self.opts),
            self.cancel.child_token(),
        )
    }

    /// Collapsed state of the `.end` resolution: failed wins, then any
    /// non-terminal node, then finished.
    pub fn end_state(&self) -> Option<NodeState> {
        let ids = self.dag.resolve_alias(".end").ok()?;
        if ids.is_empty() {
            return None;
        }
        let states: Vec<NodeState> = ids
            .iter()
            .filter_map(|&id| self.dag.node(id).map(|n| n.state))
            .collect();
        if states.iter().any(|s| *s == NodeState::Failed) {
            return Some(NodeState::Failed);
        }
        states
            .iter()
            .find(|s| !s.is_terminal())
            .copied()
            .or(Some(NodeState::Finished))
    }

    /// The bytes `.end` resolves to: node outputs concatenated in
    /// declaration order.
    pub async fn end_bytes(&self) -> Result<Vec<u8>, PipeError> {
        let ids = match self.dag.resolve_alias(".end") {
            Ok(ids) => ids,
            Err(_) => return Ok(Vec::new()),
        };
        let mut out = Vec::new();
        for id in ids {
            let name = match self.dag.node(id) {
                Some(node) => node.name,
                None => continue,
            };
            if let Ok(mut reader) = self.kv.open_read(&name) {
                out.extend_from_slice(&reader.read_to_end().await?);
            }
        }
        Ok(out)
    }

    /// Byte-level snapshot: every finished node's full output plus the
    /// alias table (alias keys start with `.`, node names never do).
    pub fn snapshot(&self) -> Vec<(String, Vec<u8>)> {
        let mut items = Vec::new();
        for node in self.dag.nodes() {
            if node.state != NodeState::Finished {
                continue;
            }
            if let Some(pipe) = self.kv.get(&node.name) {
                items.push((node.name.clone(), pipe.contents()));
            }
        }
        for (alias, targets) in self.dag.aliases() {
            let names: Vec<String> = targets
                .iter()
                .filter_map(|t| match t {
                    SourceRef::Node(id) => self.dag.node(*id).map(|n| n.name),
                    SourceRef::Alias(name) => Some(name.clone()),
                })
                .collect();
            items.push((
                alias,
                serde_json::to_vec(&names).expect("alias table serializes"),
            ));
        }
        items
    }

    /// Replay a snapshot into this environment: finished nodes come back as
    /// value nodes with their original names, then aliases are rebound.
    pub fn restore(&self, items: &[(String, Vec<u8>)]) -> Result<(), GraphError> {
        for (key, bytes) in items {
            if key.starts_with('.') {
                continue;
            }
            self.dag.restore_value_node(key, bytes, Some("restored"))?;
        }
        for (key, bytes) in items {
            if !key.starts_with('.') {
                continue;
            }
            let names: Vec<String> = match serde_json::from_slice(bytes) {
                Ok(names) => names,
                Err(e) => {
                    warn!(alias = %key, error = %e, "skipping malformed alias entry");
                    continue;
                }
            };
            for name in names {
                let target = if name.starts_with('.') {
                    Some(SourceRef::Alias(name))
                } else {
                    match self.dag.node_id_by_name(&name) {
                        Some(id) => Some(SourceRef::Node(id)),
                        None => {
                            // The target never finished, so it was not
                            // snapshotted. The alias entry is dropped.
                            warn!(alias = %key, target = %name, "alias target not restored");
                            None
                        }
                    }
                };
                if let Some(target) = target {
                    self.dag.alias(key, Some(target))?;
                }
            }
        }
        Ok(())
    }

    /// Cancel running actors and close every stream. Suspended reads see
    /// end-of-stream, writes see `EPIPE`.
    pub fn teardown(&self) {
        self.cancel.cancel();
        self.kv.close_all();
        self.queue.shutdown();
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::standard_registry;

    #[tokio::test]
    async fn test_seeded_aliases_resolve_empty() {
        let env = Environment::new(standard_registry());
        for alias in [".prompt", ".chat_messages", ".toolspecs", ".end"] {
            assert_eq!(env.dag.resolve_alias(alias).unwrap(), vec![]);
        }
    }

    #[tokio::test]
    async fn test_add_prompt_feeds_prompt_alias() {
        let env = Environment::new(standard_registry());
        let id = env.add_prompt("Hello!").unwrap();
        assert_eq!(env.dag.resolve_alias(".prompt").unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_register_tool_publishes_spec() {
        let env = Environment::new(standard_registry());
        env.register_tool("get_user_name").unwrap();

        let ids = env.dag.resolve_alias(".toolspecs").unwrap();
        assert_eq!(ids.len(), 1);
        let node = env.dag.node(ids[0]).unwrap();
        let mut reader = env.kv.open_read(&node.name).unwrap();
        let spec: serde_json::Value =
            serde_json::from_slice(&reader.read_to_end().await.unwrap()).unwrap();
        assert_eq!(spec["function"]["name"], "get_user_name");
    }

    #[tokio::test]
    async fn test_unknown_tool_rejected() {
        let env = Environment::new(standard_registry());
        assert!(matches!(
            env.register_tool("launch_missiles"),
            Err(GraphError::UnknownWorkflow(_))
        ));
    }

    #[tokio::test]
    async fn test_build_flow_points_end_at_sink() {
        let env = Environment::new(standard_registry());
        env.add_prompt("hi").unwrap();
        let sink = env.build_flow("gpt.pipeline").unwrap();
        assert_eq!(env.dag.resolve_alias(".end").unwrap(), vec![sink]);
    }

    #[tokio::test]
    async fn test_snapshot_restore_value_roundtrip() {
        let env = Environment::new(standard_registry());
        env.add_prompt("persisted").unwrap();
        let snapshot = env.snapshot();

        let fresh = Environment::new(standard_registry());
        fresh.restore(&snapshot).unwrap();

        let ids = fresh.dag.resolve_alias(".prompt").unwrap();
        assert_eq!(ids.len(), 1);
        let node = fresh.dag.node(ids[0]).unwrap();
        assert_eq!(node.state, NodeState::Finished);
        let mut reader = fresh.kv.open_read(&node.name).unwrap();
        assert_eq!(reader.read_to_end().await.unwrap(), b"persisted");
    }
}
