// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Typed DAG of nodes with dependencies, named parameters, and aliases.
//!
//! The store is the only mutable global state in the system. Mutations are
//! serialized on a write lock and every one of them notifies the well-known
//! graph-changed handle, which is what lets the scheduler re-evaluate
//! readiness while actors extend the graph under it.
//!
//! Aliases are the indirection that makes dynamic extension safe: a node can
//! depend on `.chat_messages` before anyone knows how many message nodes the
//! conversation will accumulate, and `detach_from_alias` freezes a node's
//! view of an alias so later appends do not retroactively change
//! already-scheduled work.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::errors::{ActorFailure, GraphError, KvError};
use crate::graph::template::WorkflowRegistry;
use crate::kv::KeyStore;
use crate::notify::{Handle, NotificationQueue};

/// Node ids are handles: a node is a waitable entity.
pub type NodeId = Handle;

/// Pseudo-workflow name of literal byte nodes.
pub const VALUE_WORKFLOW: &str = "value";

/// A reference to the source of a dependency: a concrete node or an alias
/// resolved at read time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Node(NodeId),
    Alias(String),
}

/// One dependency of a node. The empty `param` is the default/positional
/// input (an actor's stdin).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub param: String,
    pub source: SourceRef,
}

impl Dependency {
    pub fn positional(source: SourceRef) -> Self {
        Self {
            param: String::new(),
            source,
        }
    }

    pub fn named(param: &str, source: SourceRef) -> Self {
        Self {
            param: param.to_string(),
            source,
        }
    }
}

/// Lifecycle of a node. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    NotStarted,
    Runnable,
    Running,
    /// The actor produced at least one byte; observable before completion.
    Progressed,
    Finished,
    Failed,
}

impl NodeState {
    fn rank(self) -> u8 {
        match self {
            NodeState::NotStarted => 0,
            NodeState::Runnable => 1,
            NodeState::Running => 2,
            NodeState::Progressed => 3,
            NodeState::Finished => 4,
            NodeState::Failed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Finished | NodeState::Failed)
    }

    /// Whether a dependency in this state satisfies a consumer.
    ///
    /// Streaming consumers tolerate merely-progressed producers; everyone
    /// tolerates failed ones, because failure travels through the data.
    fn satisfies(self, streaming_consumer: bool) -> bool {
        match self {
            NodeState::Finished | NodeState::Failed => true,
            NodeState::Progressed => streaming_consumer,
            _ => false,
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            NodeState::NotStarted => "not_started",
            NodeState::Runnable => "runnable",
            NodeState::Running => "running",
            NodeState::Progressed => "progressed",
            NodeState::Finished => "finished",
            NodeState::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

/// One vertex of the DAG.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub workflow: String,
    pub deps: Vec<Dependency>,
    pub state: NodeState,
    pub error: Option<ActorFailure>,
    pub explain: Option<String>,
    /// Whether this node's actor tolerates merely-progressed inputs.
    pub streaming: bool,
}

/// A dependency resolved to a concrete node, handed to the node runtime.
#[derive(Debug, Clone)]
pub struct ResolvedDep {
    pub param: String,
    pub node_id: NodeId,
    pub node_name: String,
}

/// A node the scheduler may start right now, with its inputs pinned down.
#[derive(Debug, Clone)]
pub struct ReadyNode {
    pub id: NodeId,
    pub name: String,
    pub workflow: String,
    pub deps: Vec<ResolvedDep>,
}

struct GraphState {
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
    aliases: HashMap<String, Vec<SourceRef>>,
}

impl GraphState {
    fn node(&self, id: NodeId) -> Option<&Node> {
        self.index.get(&id).map(|&i| &self.nodes[i])
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        match self.index.get(&id) {
            Some(&i) => Some(&mut self.nodes[i]),
            None => None,
        }
    }

    /// Resolve a reference to concrete node ids: transitive through aliases,
    /// de-duplicated, declaration order preserved.
    fn resolve(&self, source: &SourceRef) -> Result<Vec<NodeId>, GraphError> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = Vec::new();
        self.expand(source, &mut stack, &mut seen, &mut out)?;
        Ok(out)
    }

    fn expand(
        &self,
        source: &SourceRef,
        stack: &mut Vec<String>,
        seen: &mut HashSet<NodeId>,
        out: &mut Vec<NodeId>,
    ) -> Result<(), GraphError> {
        match source {
            SourceRef::Node(id) => {
                if self.node(*id).is_none() {
                    return Err(GraphError::UnknownNode(format!("{}", id)));
                }
                if seen.insert(*id) {
                    out.push(*id);
                }
                Ok(())
            }
            SourceRef::Alias(name) => {
                if stack.iter().any(|a| a == name) {
                    return Err(GraphError::AliasCycle(name.clone()));
                }
                let targets = match self.aliases.get(name) {
                    Some(targets) => targets.clone(),
                    None => return Err(GraphError::UnknownAlias(name.clone())),
                };
                stack.push(name.clone());
                for target in &targets {
                    self.expand(target, stack, seen, out)?;
                }
                stack.pop();
                Ok(())
            }
        }
    }

    /// Like `resolve`, but unknown or cyclic aliases contribute nothing.
    /// Used by cycle detection, which must not fail on half-built graphs.
    fn resolve_lenient(&self, source: &SourceRef) -> Vec<NodeId> {
        self.resolve(source).unwrap_or_default()
    }

    /// DFS reachability check over the resolved dependency graph.
    /// Returns a node on a cycle, if any exists.
    fn find_cycle(&self) -> Option<NodeId> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        fn visit(state: &GraphState, id: NodeId, colors: &mut HashMap<NodeId, u8>) -> Option<NodeId> {
            colors.insert(id, GRAY);
            if let Some(node) = state.node(id) {
                for dep in &node.deps {
                    for target in state.resolve_lenient(&dep.source) {
                        match colors.get(&target).copied().unwrap_or(WHITE) {
                            GRAY => return Some(target),
                            WHITE => {
                                if let Some(hit) = visit(state, target, colors) {
                                    return Some(hit);
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
            colors.insert(id, BLACK);
            None
        }

        let mut colors = HashMap::new();
        for node in &self.nodes {
            if colors.get(&node.id).copied().unwrap_or(WHITE) == WHITE {
                if let Some(hit) = visit(self, node.id, &mut colors) {
                    return Some(hit);
                }
            }
        }
        None
    }
}

/// The DAG store: graph of nodes scanned linearly, safe under concurrent
/// mutation (actors) and read (scheduler).
pub struct DagStore {
    state: RwLock<GraphState>,
    queue: Arc<NotificationQueue>,
    kv: Arc<KeyStore>,
    graph_changed: Handle,
    /// Bumped on every byte-level or terminal transition; `one_step` keys
    /// off this.
    progress_rev: AtomicU64,
}

impl DagStore {
    pub fn new(queue: Arc<NotificationQueue>, kv: Arc<KeyStore>) -> Self {
        let graph_changed = queue.register("dag.graph_changed");
        Self {
            state: RwLock::new(GraphState {
                nodes: Vec::new(),
                index: HashMap::new(),
                aliases: HashMap::new(),
            }),
            queue,
            kv,
            graph_changed,
            progress_rev: AtomicU64::new(0),
        }
    }

    /// The handle notified after every mutation; the scheduler's awaker
    /// waits on it.
    pub fn graph_changed(&self) -> Handle {
        self.graph_changed
    }

    /// Monotonic count of progressed/finished/failed transitions.
    pub fn progress_rev(&self) -> u64 {
        self.progress_rev.load(Ordering::Acquire)
    }

    fn touch(&self) {
        self.progress_rev.fetch_add(1, Ordering::AcqRel);
    }

    fn notify_changed(&self, payload: NodeId) {
        let _ = self.queue.notify(self.graph_changed, clamp_id(payload));
    }

    /// Create a finished node over a fixed byte buffer and publish the bytes
    /// to the KV store under the node name.
    pub fn add_value_node(
        &self,
        bytes: &[u8],
        explain: Option<&str>,
    ) -> Result<NodeId, GraphError> {
        let id = self.queue.register("dag.value_node");
        let name = format!("{}.{}", VALUE_WORKFLOW, id.id());
        self.install_value(id, &name, bytes, explain)
    }

    /// Re-create a value node under a name saved by a previous run.
    pub fn restore_value_node(
        &self,
        name: &str,
        bytes: &[u8],
        explain: Option<&str>,
    ) -> Result<NodeId, GraphError> {
        if let Some(suffix) = name.rsplit('.').next().and_then(|s| s.parse::<u32>().ok()) {
            self.queue.reserve_up_to(suffix);
        }
        let id = self.queue.register("dag.restored_value");
        self.install_value(id, name, bytes, explain)
    }

    fn install_value(
        &self,
        id: NodeId,
        name: &str,
        bytes: &[u8],
        explain: Option<&str>,
    ) -> Result<NodeId, GraphError> {
        match self.kv.put_value(name, bytes) {
            Ok(_) => {}
            Err(KvError::Exists(key)) => return Err(GraphError::NameTaken(key)),
            Err(KvError::NotFound(key)) => return Err(GraphError::UnknownNode(key)),
        }
        {
            let mut state = self.state.write();
            if state.nodes.iter().any(|n| n.name == name) {
                return Err(GraphError::NameTaken(name.to_string()));
            }
            push_node(
                &mut state,
                Node {
                    id,
                    name: name.to_string(),
                    workflow: VALUE_WORKFLOW.to_string(),
                    deps: Vec::new(),
                    state: NodeState::Finished,
                    error: None,
                    explain: explain.map(str::to_string),
                    streaming: false,
                },
            );
        }
        self.touch();
        self.notify_changed(id);
        debug!(node = %name, "value node added");
        Ok(id)
    }

    /// Create a value-like node whose bytes arrive later through a pipe.
    /// The node starts `Running`; [`DagStore::mark_finished`] seals it.
    pub fn add_open_value_node(
        &self,
        explain: Option<&str>,
    ) -> Result<(NodeId, Arc<crate::pipe::Pipe>), GraphError> {
        let id = self.queue.register("dag.open_value_node");
        let name = format!("{}.{}", VALUE_WORKFLOW, id.id());
        let pipe = match self.kv.create_pipe(&name) {
            Ok(pipe) => pipe,
            Err(KvError::Exists(key)) => return Err(GraphError::NameTaken(key)),
            Err(KvError::NotFound(key)) => return Err(GraphError::UnknownNode(key)),
        };
        {
            let mut state = self.state.write();
            push_node(
                &mut state,
                Node {
                    id,
                    name,
                    workflow: VALUE_WORKFLOW.to_string(),
                    deps: Vec::new(),
                    state: NodeState::Running,
                    error: None,
                    explain: explain.map(str::to_string),
                    streaming: false,
                },
            );
        }
        self.notify_changed(id);
        Ok((id, pipe))
    }

    /// Register an actor node. The unique name is derived from the hint and
    /// the freshly minted id.
    pub fn add_node(
        &self,
        name_hint: &str,
        workflow: &str,
        streaming: bool,
        deps: Vec<Dependency>,
        explain: Option<&str>,
    ) -> Result<NodeId, GraphError> {
        let id = self.queue.register(&format!("dag.node {}", name_hint));
        let name = format!("{}.{}", name_hint, id.id());
        {
            let mut state = self.state.write();
            // Concrete node references must exist up front; alias references
            // are allowed to dangle until schedule time.
            for dep in &deps {
                if let SourceRef::Node(dep_id) = &dep.source {
                    if state.node(*dep_id).is_none() {
                        return Err(GraphError::UnknownNode(format!("{}", dep_id)));
                    }
                }
            }
            push_node(
                &mut state,
                Node {
                    id,
                    name,
                    workflow: workflow.to_string(),
                    deps,
                    state: NodeState::NotStarted,
                    error: None,
                    explain: explain.map(str::to_string),
                    streaming,
                },
            );
        }
        self.notify_changed(id);
        Ok(id)
    }

    /// Append a target to an alias, or create an empty alias with `None`.
    ///
    /// Rejects appends that would make some node reachable from itself
    /// through the alias.
    pub fn alias(&self, name: &str, target: Option<SourceRef>) -> Result<(), GraphError> {
        {
            let mut state = self.state.write();
            let target = match target {
                None => {
                    state.aliases.entry(name.to_string()).or_default();
                    drop(state);
                    self.notify_changed(Handle::NEVER);
                    return Ok(());
                }
                Some(target) => target,
            };
            if let SourceRef::Node(id) = &target {
                if state.node(*id).is_none() {
                    return Err(GraphError::UnknownNode(format!("{}", id)));
                }
            }
            state
                .aliases
                .entry(name.to_string())
                .or_default()
                .push(target);
            if let Some(on_cycle) = state.find_cycle() {
                // Roll the append back; the graph must stay acyclic.
                if let Some(targets) = state.aliases.get_mut(name) {
                    targets.pop();
                }
                let to = state
                    .node(on_cycle)
                    .map(|n| n.name.clone())
                    .unwrap_or_else(|| format!("{}", on_cycle));
                return Err(GraphError::CycleDetected {
                    from: name.to_string(),
                    to,
                });
            }
        }
        self.notify_changed(Handle::NEVER);
        Ok(())
    }

    /// Replace an alias's target list outright. Used to hand `.end` to a new
    /// sink during loop unrolling.
    pub fn realias(&self, name: &str, target: SourceRef) -> Result<(), GraphError> {
        {
            let mut state = self.state.write();
            if let SourceRef::Node(id) = &target {
                if state.node(*id).is_none() {
                    return Err(GraphError::UnknownNode(format!("{}", id)));
                }
            }
            let previous = state.aliases.insert(name.to_string(), vec![target]);
            if state.find_cycle().is_some() {
                match previous {
                    Some(previous) => {
                        state.aliases.insert(name.to_string(), previous);
                    }
                    None => {
                        state.aliases.remove(name);
                    }
                }
                return Err(GraphError::CycleDetected {
                    from: name.to_string(),
                    to: name.to_string(),
                });
            }
        }
        self.notify_changed(Handle::NEVER);
        Ok(())
    }

    /// Snapshot the alias's current resolution into every referring node, so
    /// later alias mutations no longer affect them.
    pub fn detach_from_alias(&self, name: &str) -> Result<(), GraphError> {
        {
            let mut state = self.state.write();
            let resolution = state.resolve(&SourceRef::Alias(name.to_string()))?;
            for i in 0..state.nodes.len() {
                if !state.nodes[i]
                    .deps
                    .iter()
                    .any(|d| d.source == SourceRef::Alias(name.to_string()))
                {
                    continue;
                }
                let mut rewritten = Vec::with_capacity(state.nodes[i].deps.len());
                for dep in &state.nodes[i].deps {
                    if dep.source == SourceRef::Alias(name.to_string()) {
                        for &id in &resolution {
                            rewritten.push(Dependency {
                                param: dep.param.clone(),
                                source: SourceRef::Node(id),
                            });
                        }
                    } else {
                        rewritten.push(dep.clone());
                    }
                }
                state.nodes[i].deps = rewritten;
            }
        }
        self.notify_changed(Handle::NEVER);
        debug!(alias = name, "alias detached");
        Ok(())
    }

    /// Graft a workflow template into the graph, wiring its external inputs
    /// through `deps_map`. Returns the id of the template's sink node.
    pub fn instantiate_with_deps(
        &self,
        registry: &WorkflowRegistry,
        workflow: &str,
        deps_map: &HashMap<String, SourceRef>,
    ) -> Result<NodeId, GraphError> {
        let template = registry
            .template(workflow)
            .ok_or_else(|| GraphError::UnknownWorkflow(workflow.to_string()))?;

        let mut sink = Handle::NEVER;
        {
            let mut state = self.state.write();
            let rollback_nodes = state.nodes.len();
            let rollback_aliases = state.aliases.clone();

            let mut local: HashMap<&str, NodeId> = HashMap::new();
            for step in &template.nodes {
                let streaming = match registry.actor(&step.workflow) {
                    Some(spec) => spec.streaming,
                    None => {
                        roll_back(&mut state, rollback_nodes, rollback_aliases.clone());
                        return Err(GraphError::UnknownWorkflow(step.workflow.clone()));
                    }
                };

                let mut deps = Vec::with_capacity(step.inputs.len());
                for (param, source) in &step.inputs {
                    let source_ref = if let Some(&id) = local.get(source.as_str()) {
                        SourceRef::Node(id)
                    } else if let Some(mapped) = deps_map.get(source) {
                        mapped.clone()
                    } else {
                        SourceRef::Alias(source.clone())
                    };
                    if let SourceRef::Node(id) = &source_ref {
                        if state.node(*id).is_none() {
                            roll_back(&mut state, rollback_nodes, rollback_aliases.clone());
                            return Err(GraphError::UnknownNode(format!("{}", id)));
                        }
                    }
                    deps.push(Dependency {
                        param: param.clone(),
                        source: source_ref,
                    });
                }

                let id = self.queue.register(&format!("dag.node {}", step.hint));
                let name = format!("{}.{}", step.hint, id.id());
                push_node(
                    &mut state,
                    Node {
                        id,
                        name,
                        workflow: step.workflow.clone(),
                        deps,
                        state: NodeState::NotStarted,
                        error: None,
                        explain: Some(format!("from {}", workflow)),
                        streaming,
                    },
                );
                for alias_name in &step.publish {
                    state
                        .aliases
                        .entry(alias_name.clone())
                        .or_default()
                        .push(SourceRef::Node(id));
                }
                local.insert(step.name.as_str(), id);
                sink = id;
            }

            if let Some(on_cycle) = state.find_cycle() {
                let to = state
                    .node(on_cycle)
                    .map(|n| n.name.clone())
                    .unwrap_or_else(|| format!("{}", on_cycle));
                roll_back(&mut state, rollback_nodes, rollback_aliases.clone());
                return Err(GraphError::CycleDetected {
                    from: workflow.to_string(),
                    to,
                });
            }
        }
        self.notify_changed(sink);
        debug!(workflow, sink = sink.id(), "workflow instantiated");
        Ok(sink)
    }

    /// Compute runnable nodes and doom the unschedulable ones.
    ///
    /// Ready nodes transition to `Runnable` and come back with their
    /// dependencies resolved to concrete nodes, in creation (id) order.
    /// Nodes whose dependencies name unknown or cyclic aliases transition to
    /// `Failed` right here, at schedule time.
    pub fn poll_ready(&self) -> (Vec<ReadyNode>, Vec<(NodeId, GraphError)>) {
        let mut ready = Vec::new();
        let mut doomed = Vec::new();
        {
            let mut state = self.state.write();
            let candidates: Vec<usize> = (0..state.nodes.len())
                .filter(|&i| {
                    matches!(
                        state.nodes[i].state,
                        NodeState::NotStarted | NodeState::Runnable
                    )
                })
                .collect();

            for i in candidates {
                let streaming = state.nodes[i].streaming;
                let mut resolved = Vec::new();
                let mut seen = HashSet::new();
                let mut satisfied = true;
                let mut failure = None;

                for dep in state.nodes[i].deps.clone() {
                    match state.resolve(&dep.source) {
                        Ok(ids) => {
                            for id in ids {
                                let dep_node = state.node(id).expect("resolve yields live ids");
                                if !dep_node.state.satisfies(streaming) {
                                    satisfied = false;
                                    break;
                                }
                                if seen.insert((dep.param.clone(), id)) {
                                    resolved.push(ResolvedDep {
                                        param: dep.param.clone(),
                                        node_id: id,
                                        node_name: dep_node.name.clone(),
                                    });
                                }
                            }
                        }
                        Err(e) => {
                            failure = Some(e);
                        }
                    }
                    if failure.is_some() || !satisfied {
                        break;
                    }
                }

                if let Some(e) = failure {
                    let node = &mut state.nodes[i];
                    node.state = NodeState::Failed;
                    node.error = Some(ActorFailure::Graph(e.clone()));
                    doomed.push((node.id, e));
                    continue;
                }
                if !satisfied {
                    continue;
                }
                let node = &mut state.nodes[i];
                node.state = NodeState::Runnable;
                ready.push(ReadyNode {
                    id: node.id,
                    name: node.name.clone(),
                    workflow: node.workflow.clone(),
                    deps: resolved,
                });
            }
        }
        for (id, _) in &doomed {
            self.touch();
            self.notify_changed(*id);
        }
        (ready, doomed)
    }

    /// Readiness computation without side effects, for dry runs.
    pub fn ready_preview(&self) -> Vec<String> {
        let state = self.state.read();
        let mut names = Vec::new();
        for node in &state.nodes {
            if !matches!(node.state, NodeState::NotStarted | NodeState::Runnable) {
                continue;
            }
            let ok = node.deps.iter().all(|dep| match state.resolve(&dep.source) {
                Ok(ids) => ids.iter().all(|&id| {
                    state
                        .node(id)
                        .map(|n| n.state.satisfies(node.streaming))
                        .unwrap_or(false)
                }),
                Err(_) => false,
            });
            if ok {
                names.push(node.name.clone());
            }
        }
        names
    }

    pub fn mark_running(&self, id: NodeId) {
        self.transition(id, NodeState::Running, None, false);
    }

    pub fn mark_progressed(&self, id: NodeId) {
        self.transition(id, NodeState::Progressed, None, true);
    }

    pub fn mark_finished(&self, id: NodeId) {
        self.transition(id, NodeState::Finished, None, true);
    }

    pub fn mark_failed(&self, id: NodeId, failure: ActorFailure) {
        self.transition(id, NodeState::Failed, Some(failure), true);
    }

    fn transition(
        &self,
        id: NodeId,
        next: NodeState,
        failure: Option<ActorFailure>,
        observable: bool,
    ) {
        {
            let mut state = self.state.write();
            let node = match state.node_mut(id) {
                Some(node) => node,
                None => {
                    warn!(node = id.id(), "transition on unknown node");
                    return;
                }
            };
            if node.state.rank() >= next.rank() {
                // Progressed may be reported more than once by racing
                // watchers; anything else going backwards is a bug upstream.
                if !(node.state == next || next == NodeState::Progressed) {
                    warn!(
                        node = %node.name,
                        from = %node.state,
                        to = %next,
                        "ignoring non-monotonic transition"
                    );
                }
                return;
            }
            node.state = next;
            if let Some(failure) = failure {
                node.error = Some(failure);
            }
            debug!(node = %node.name, state = %next, "node transition");
        }
        if observable {
            self.touch();
        }
        self.notify_changed(id);
    }

    pub fn resolve(&self, source: &SourceRef) -> Result<Vec<NodeId>, GraphError> {
        self.state.read().resolve(source)
    }

    pub fn resolve_alias(&self, name: &str) -> Result<Vec<NodeId>, GraphError> {
        self.resolve(&SourceRef::Alias(name.to_string()))
    }

    pub fn has_alias(&self, name: &str) -> bool {
        self.state.read().aliases.contains_key(name)
    }

    pub fn node(&self, id: NodeId) -> Option<Node> {
        self.state.read().node(id).cloned()
    }

    pub fn node_id_by_name(&self, name: &str) -> Option<NodeId> {
        self.state
            .read()
            .nodes
            .iter()
            .find(|n| n.name == name)
            .map(|n| n.id)
    }

    /// All nodes in creation order.
    pub fn nodes(&self) -> Vec<Node> {
        self.state.read().nodes.clone()
    }

    /// All aliases with their raw (unresolved) targets.
    pub fn aliases(&self) -> Vec<(String, Vec<SourceRef>)> {
        let state = self.state.read();
        let mut out: Vec<(String, Vec<SourceRef>)> = state
            .aliases
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

fn push_node(state: &mut GraphState, node: Node) {
    state.index.insert(node.id, state.nodes.len());
    state.nodes.push(node);
}

fn roll_back(state: &mut GraphState, node_count: usize, aliases: HashMap<String, Vec<SourceRef>>) {
    while state.nodes.len() > node_count {
        let node = state.nodes.pop().expect("len checked");
        state.index.remove(&node.id);
    }
    state.aliases = aliases;
}

fn clamp_id(id: NodeId) -> i32 {
    i32::try_from(id.id()).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::Actor;
    use crate::graph::template::{TemplateNode, WorkflowTemplate};
    use crate::runtime::NodeRuntime;

    struct NullActor;

    #[async_trait::async_trait]
    impl Actor for NullActor {
        async fn run(&self, _rt: Arc<NodeRuntime>) -> Result<(), ActorFailure> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "null"
        }
    }

    fn fixture() -> (Arc<NotificationQueue>, Arc<KeyStore>, DagStore) {
        let queue = Arc::new(NotificationQueue::new());
        let kv = Arc::new(KeyStore::new(Arc::clone(&queue)));
        let dag = DagStore::new(Arc::clone(&queue), Arc::clone(&kv));
        (queue, kv, dag)
    }

    fn registry_with(template: WorkflowTemplate) -> WorkflowRegistry {
        let mut registry = WorkflowRegistry::new();
        for step in &template.nodes {
            registry.register_actor(&step.workflow, Arc::new(NullActor), false);
        }
        registry.register_template(template);
        registry
    }

    #[tokio::test]
    async fn test_value_node_is_finished_and_published() {
        let (_queue, kv, dag) = fixture();
        let id = dag.add_value_node(b"Hello!", Some("greeting")).unwrap();

        let node = dag.node(id).unwrap();
        assert_eq!(node.state, NodeState::Finished);
        assert_eq!(node.workflow, VALUE_WORKFLOW);

        let mut reader = kv.open_read(&node.name).unwrap();
        assert_eq!(reader.read_to_end().await.unwrap(), b"Hello!");
    }

    #[tokio::test]
    async fn test_add_node_generates_unique_names() {
        let (_queue, _kv, dag) = fixture();
        let a = dag.add_node("worker", "w", false, vec![], None).unwrap();
        let b = dag.add_node("worker", "w", false, vec![], None).unwrap();
        assert_ne!(dag.node(a).unwrap().name, dag.node(b).unwrap().name);
    }

    #[tokio::test]
    async fn test_unknown_node_dependency_rejected() {
        let (queue, _kv, dag) = fixture();
        let ghost = queue.register("never a node");
        let result = dag.add_node(
            "consumer",
            "w",
            false,
            vec![Dependency::positional(SourceRef::Node(ghost))],
            None,
        );
        assert!(matches!(result, Err(GraphError::UnknownNode(_))));
    }

    #[tokio::test]
    async fn test_alias_resolution_is_transitive_and_deduped() {
        let (_queue, _kv, dag) = fixture();
        let v1 = dag.add_value_node(b"1", None).unwrap();
        let v2 = dag.add_value_node(b"2", None).unwrap();

        dag.alias("inner", Some(SourceRef::Node(v1))).unwrap();
        dag.alias("inner", Some(SourceRef::Node(v2))).unwrap();
        dag.alias("outer", Some(SourceRef::Alias("inner".into())))
            .unwrap();
        dag.alias("outer", Some(SourceRef::Node(v1))).unwrap(); // duplicate via alias

        assert_eq!(dag.resolve_alias("outer").unwrap(), vec![v1, v2]);
    }

    #[tokio::test]
    async fn test_alias_cycle_fails_at_resolve() {
        let (_queue, _kv, dag) = fixture();
        dag.alias("a", Some(SourceRef::Alias("b".into()))).unwrap();
        dag.alias("b", Some(SourceRef::Alias("a".into()))).unwrap();
        assert!(matches!(
            dag.resolve_alias("a"),
            Err(GraphError::AliasCycle(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_alias_is_resolve_error() {
        let (_queue, _kv, dag) = fixture();
        assert!(matches!(
            dag.resolve_alias("ghost"),
            Err(GraphError::UnknownAlias(_))
        ));
    }

    #[tokio::test]
    async fn test_cycle_through_alias_rejected() {
        let (_queue, _kv, dag) = fixture();
        // a depends on alias X; aliasing X to a would close the loop.
        let a = dag
            .add_node(
                "a",
                "w",
                false,
                vec![Dependency::positional(SourceRef::Alias("x".into()))],
                None,
            )
            .unwrap();
        dag.alias("x", None).unwrap();
        let result = dag.alias("x", Some(SourceRef::Node(a)));
        assert!(matches!(result, Err(GraphError::CycleDetected { .. })));
        // The rejected append must not have stuck.
        assert_eq!(dag.resolve_alias("x").unwrap(), vec![]);
    }

    #[tokio::test]
    async fn test_detach_freezes_alias_resolution() {
        let (_queue, _kv, dag) = fixture();
        let v1 = dag.add_value_node(b"old", None).unwrap();
        dag.alias("msgs", Some(SourceRef::Node(v1))).unwrap();

        let consumer = dag
            .add_node(
                "consumer",
                "w",
                false,
                vec![Dependency::positional(SourceRef::Alias("msgs".into()))],
                None,
            )
            .unwrap();

        dag.detach_from_alias("msgs").unwrap();

        // Later alias growth must not reach the detached node.
        let v2 = dag.add_value_node(b"new", None).unwrap();
        dag.alias("msgs", Some(SourceRef::Node(v2))).unwrap();

        let node = dag.node(consumer).unwrap();
        assert_eq!(node.deps.len(), 1);
        assert_eq!(node.deps[0].source, SourceRef::Node(v1));
        assert_eq!(dag.resolve_alias("msgs").unwrap(), vec![v1, v2]);
    }

    #[tokio::test]
    async fn test_ready_nodes_wait_for_finished_deps() {
        let (_queue, _kv, dag) = fixture();
        let producer = dag.add_node("producer", "w", false, vec![], None).unwrap();
        let consumer = dag
            .add_node(
                "consumer",
                "w",
                false,
                vec![Dependency::positional(SourceRef::Node(producer))],
                None,
            )
            .unwrap();

        let (ready, doomed) = dag.poll_ready();
        assert!(doomed.is_empty());
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, producer);

        dag.mark_running(producer);
        dag.mark_progressed(producer);
        // Non-streaming consumer: progressed is not enough.
        let (ready, _) = dag.poll_ready();
        assert!(ready.is_empty());

        dag.mark_finished(producer);
        let (ready, _) = dag.poll_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, consumer);
    }

    #[tokio::test]
    async fn test_streaming_consumer_ready_on_progress() {
        let (_queue, _kv, dag) = fixture();
        let producer = dag.add_node("producer", "w", false, vec![], None).unwrap();
        let consumer = dag
            .add_node(
                "consumer",
                "w",
                true,
                vec![Dependency::positional(SourceRef::Node(producer))],
                None,
            )
            .unwrap();

        dag.mark_running(producer);
        dag.mark_progressed(producer);
        let (ready, _) = dag.poll_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, consumer);
    }

    #[tokio::test]
    async fn test_failed_dep_still_schedules_consumer() {
        let (_queue, _kv, dag) = fixture();
        let producer = dag.add_node("producer", "w", false, vec![], None).unwrap();
        let consumer = dag
            .add_node(
                "consumer",
                "w",
                false,
                vec![Dependency::positional(SourceRef::Node(producer))],
                None,
            )
            .unwrap();

        dag.mark_running(producer);
        dag.mark_failed(producer, ActorFailure::Other("boom".into()));

        let (ready, _) = dag.poll_ready();
        assert_eq!(ready.len(), 1, "failure propagates by data, not by blocking");
        assert_eq!(ready[0].id, consumer);
    }

    #[tokio::test]
    async fn test_unknown_alias_dep_fails_at_schedule_time() {
        let (_queue, _kv, dag) = fixture();
        let id = dag
            .add_node(
                "doomed",
                "w",
                false,
                vec![Dependency::positional(SourceRef::Alias("ghost".into()))],
                None,
            )
            .unwrap();

        let (ready, doomed) = dag.poll_ready();
        assert!(ready.is_empty());
        assert_eq!(doomed.len(), 1);
        assert_eq!(doomed[0].0, id);
        assert_eq!(dag.node(id).unwrap().state, NodeState::Failed);
    }

    #[tokio::test]
    async fn test_empty_alias_dep_is_satisfied() {
        let (_queue, _kv, dag) = fixture();
        dag.alias("empty", None).unwrap();
        let id = dag
            .add_node(
                "ok",
                "w",
                false,
                vec![Dependency::positional(SourceRef::Alias("empty".into()))],
                None,
            )
            .unwrap();
        let (ready, doomed) = dag.poll_ready();
        assert!(doomed.is_empty());
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, id);
    }

    #[tokio::test]
    async fn test_transitions_are_monotonic() {
        let (_queue, _kv, dag) = fixture();
        let id = dag.add_node("n", "w", false, vec![], None).unwrap();
        dag.mark_running(id);
        dag.mark_finished(id);
        // A late failure report must not regress a finished node.
        dag.mark_failed(id, ActorFailure::Other("late".into()));
        assert_eq!(dag.node(id).unwrap().state, NodeState::Finished);
    }

    #[tokio::test]
    async fn test_mutations_notify_graph_changed() {
        let (queue, _kv, dag) = fixture();
        let mut sub = queue.subscribe(dag.graph_changed(), 16, "test").unwrap();
        dag.add_value_node(b"x", None).unwrap();
        // One notification per mutation, in order.
        assert!(sub.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_instantiate_with_deps_grafts_template() {
        let (_queue, _kv, dag) = fixture();
        let template = WorkflowTemplate {
            name: "pair".into(),
            nodes: vec![
                TemplateNode {
                    name: "first".into(),
                    hint: "first".into(),
                    workflow: "demo.first".into(),
                    inputs: vec![(String::new(), ".input".into())],
                    publish: vec![],
                },
                TemplateNode {
                    name: "second".into(),
                    hint: "second".into(),
                    workflow: "demo.second".into(),
                    inputs: vec![(String::new(), "first".into())],
                    publish: vec![".out".into()],
                },
            ],
        };
        let registry = registry_with(template);

        let input = dag.add_value_node(b"seed", None).unwrap();
        let mut deps_map = HashMap::new();
        deps_map.insert(".input".to_string(), SourceRef::Node(input));

        let sink = dag
            .instantiate_with_deps(&registry, "pair", &deps_map)
            .unwrap();

        let sink_node = dag.node(sink).unwrap();
        assert_eq!(sink_node.workflow, "demo.second");
        // Sink published to the .out alias.
        assert_eq!(dag.resolve_alias(".out").unwrap(), vec![sink]);
        // Sink depends on the first template node, which depends on the seed.
        let first_id = match &sink_node.deps[0].source {
            SourceRef::Node(id) => *id,
            other => panic!("expected node ref, got {:?}", other),
        };
        let first = dag.node(first_id).unwrap();
        assert_eq!(first.deps[0].source, SourceRef::Node(input));
    }

    #[tokio::test]
    async fn test_instantiate_unknown_workflow() {
        let (_queue, _kv, dag) = fixture();
        let registry = WorkflowRegistry::new();
        let result = dag.instantiate_with_deps(&registry, "nope", &HashMap::new());
        assert!(matches!(result, Err(GraphError::UnknownWorkflow(_))));
    }

    #[tokio::test]
    async fn test_restore_value_node_reserves_ids() {
        let (_queue, _kv, dag) = fixture();
        dag.restore_value_node("value.90", b"old", None).unwrap();
        // Fresh nodes must not collide with the restored name.
        let fresh = dag.add_value_node(b"new", None).unwrap();
        assert!(fresh.id() > 90);
    }
}
