// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Cooperative scheduler.
//!
//! The driver loop: arm the awaker (a subscription on the graph-changed
//! handle), schedule every ready node in id order, then wait for an actor
//! to finish or the graph to change. Actors run as tokio tasks; a progress
//! watcher per node observes the first byte on its output pipe and flips
//! the node to `Progressed`, which is what lets streaming consumers start
//! while their producers are still writing.
//!
//! Failure never unwinds across the graph: a failed actor poisons its
//! output pipe and the rest of the DAG keeps going, reading `EIO` where it
//! touches the poisoned stream.


use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::environment::EnvOpts;
use crate::errors::{ActorFailure, GraphError, QueueError};
use crate::graph::{dump, DagStore, NodeId, ReadyNode, SourceRef, WorkflowRegistry};
use crate::kv::KeyStore;
use crate::notify::{NotificationQueue, Subscription};
use crate::runtime::NodeRuntime;

const AWAKER_CAPACITY: usize = 256;
const PROGRESS_CAPACITY: usize = 16;

/// Why a drive returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// `.end` resolved to terminal nodes and nothing is left to run.
    Completed,
    /// Nothing runnable, nothing running, `.end` unresolved: the graph is
    /// wedged (typically unsatisfiable dependencies).
    Stalled,
    /// `one_step` observed a transition and returned.
    Stepped,
    /// A stop sentinel matched.
    StopHit(String),
    /// The environment was torn down mid-run.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriveMode {
    ToCompletion,
    OneStep,
}

/// In-flight execution state, kept across `one_step` calls so a partial
/// drive never aborts running actors.
struct DriveState {
    awaker: Subscription,
    tasks: JoinSet<(NodeId, Result<(), ActorFailure>)>,
    task_nodes: HashMap<tokio::task::Id, NodeId>,
}

/// Drives actors to completion while they mutate the graph under it.
pub struct Scheduler {
    queue: Arc<NotificationQueue>,
    kv: Arc<KeyStore>,
    dag: Arc<DagStore>,
    registry: Arc<WorkflowRegistry>,
    opts: Arc<EnvOpts>,
    cancel: CancellationToken,
    stop_before: Option<String>,
    stop_after: Option<String>,
    drive_state: Option<DriveState>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<NotificationQueue>,
        kv: Arc<KeyStore>,
        dag: Arc<DagStore>,
        registry: Arc<WorkflowRegistry>,
        opts: Arc<EnvOpts>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            kv,
            dag,
            registry,
            opts,
            cancel,
            stop_before: None,
            stop_after: None,
            drive_state: None,
        }
    }

    /// Install a sentinel: return before the named node (or alias) starts.
    pub fn stop_before(&mut self, name_or_alias: &str) {
        self.stop_before = Some(name_or_alias.to_string());
    }

    /// Install a sentinel: return once the named node (or alias) completes.
    pub fn stop_after(&mut self, name_or_alias: &str) {
        self.stop_after = Some(name_or_alias.to_string());
    }

    /// Drive to completion.
    pub async fn run(&mut self) -> Result<RunOutcome, QueueError> {
        self.drive(DriveMode::ToCompletion).await
    }

    /// Execute until the first observable transition (progress, finish, or
    /// failure), then return.
    pub async fn one_step(&mut self) -> Result<RunOutcome, QueueError> {
        self.drive(DriveMode::OneStep).await
    }

    /// Readiness computation plus a dependency-tree dump. Mutates nothing.
    pub fn dry_run(&self) -> String {
        let mut out = String::new();
        let ready = self.dag.ready_preview();
        out.push_str("ready:\n");
        if ready.is_empty() {
            out.push_str("  (none)\n");
        }
        for name in ready {
            out.push_str(&format!("  {}\n", name));
        }
        if self.dag.has_alias(".end") {
            out.push('\n');
            out.push_str(&dump::dependency_tree(
                &self.dag,
                &SourceRef::Alias(".end".to_string()),
            ));
        }
        out
    }

    async fn drive(&mut self, mode: DriveMode) -> Result<RunOutcome, QueueError> {
        let mut state = match self.drive_state.take() {
            Some(state) => state,
            None => DriveState {
                awaker: self.queue.subscribe(
                    self.dag.graph_changed(),
                    AWAKER_CAPACITY,
                    "scheduler.awaker",
                )?,
                tasks: JoinSet::new(),
                task_nodes: HashMap::new(),
            },
        };
        let outcome = self.drive_loop(mode, &mut state).await;
        // Keep in-flight actors alive for the next one_step / run call.
        self.drive_state = Some(state);
        outcome
    }

    async fn drive_loop(
        &self,
        mode: DriveMode,
        state: &mut DriveState,
    ) -> Result<RunOutcome, QueueError> {
        let start_rev = self.dag.progress_rev();

        loop {
            if mode == DriveMode::OneStep && self.dag.progress_rev() > start_rev {
                return Ok(RunOutcome::Stepped);
            }

            let (ready, doomed) = self.dag.poll_ready();
            for (id, error) in doomed {
                warn!(node = id.id(), error = %error, "node failed at schedule time");
            }
            for node in ready {
                if let Some(stop) = self.stop_before.clone() {
                    if self.matches_stop(&stop, node.id, &node.name) {
                        debug!(node = %node.name, "stop-before sentinel hit");
                        return Ok(RunOutcome::StopHit(stop));
                    }
                }
                self.spawn_node(node, &mut state.tasks, &mut state.task_nodes);
            }

            if state.tasks.is_empty() {
                if self.end_terminal() {
                    return Ok(RunOutcome::Completed);
                }
                if mode == DriveMode::OneStep && self.dag.progress_rev() > start_rev {
                    return Ok(RunOutcome::Stepped);
                }
                if self.dag.ready_preview().is_empty() {
                    warn!("no runnable or running nodes and .end is unresolved");
                    return Ok(RunOutcome::Stalled);
                }
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    state.tasks.abort_all();
                    return Ok(RunOutcome::Cancelled);
                }
                Some(joined) = state.tasks.join_next_with_id() => {
                    let completed = match joined {
                        Ok((task_id, (node_id, result))) => {
                            state.task_nodes.remove(&task_id);
                            self.complete_node(node_id, result);
                            Some(node_id)
                        }
                        Err(join_error) => {
                            let node_id = state.task_nodes.remove(&join_error.id());
                            if let Some(node_id) = node_id {
                                self.complete_node(
                                    node_id,
                                    Err(ActorFailure::Panicked(join_error.to_string())),
                                );
                            } else {
                                warn!(error = %join_error, "join error for unknown task");
                            }
                            node_id
                        }
                    };
                    if let (Some(stop), Some(node_id)) = (self.stop_after.clone(), completed) {
                        let name = self
                            .dag
                            .node(node_id)
                            .map(|n| n.name)
                            .unwrap_or_default();
                        if self.matches_stop(&stop, node_id, &name) {
                            debug!(node = %name, "stop-after sentinel hit");
                            return Ok(RunOutcome::StopHit(stop));
                        }
                    }
                }
                event = state.awaker.recv() => {
                    match event {
                        Err(QueueError::Overflow { missed, .. }) => {
                            // The next poll_ready pass re-presents the full
                            // ready set, so missed events only cost latency.
                            warn!(missed, "awaker subscription overflowed");
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn spawn_node(
        &self,
        node: ReadyNode,
        tasks: &mut JoinSet<(NodeId, Result<(), ActorFailure>)>,
        task_nodes: &mut HashMap<tokio::task::Id, NodeId>,
    ) {
        self.dag.mark_running(node.id);

        // The stdout pipe exists before the body starts so downstream
        // subscribers (and the progress watcher) can attach.
        let pipe = match self.kv.create_pipe(&node.name) {
            Ok(pipe) => pipe,
            Err(e) => {
                self.dag
                    .mark_failed(node.id, ActorFailure::Other(e.to_string()));
                return;
            }
        };

        match self
            .queue
            .subscribe(pipe.handle(), PROGRESS_CAPACITY, "scheduler.progress")
        {
            Ok(mut progress) => {
                let dag = Arc::clone(&self.dag);
                let id = node.id;
                tokio::spawn(async move {
                    loop {
                        match progress.recv().await {
                            Ok(n) if n > 0 => {
                                dag.mark_progressed(id);
                                break;
                            }
                            Ok(n) if n < 0 => break, // closed without bytes
                            Ok(_) => continue,       // zero-byte write
                            Err(_) => {
                                // Overflow means bytes definitely flowed.
                                dag.mark_progressed(id);
                                break;
                            }
                        }
                    }
                });
            }
            Err(e) => warn!(node = %node.name, error = %e, "no progress watcher"),
        }

        let spec = match self.registry.actor(&node.workflow) {
            Some(spec) => spec.clone(),
            None => {
                pipe.poison();
                self.dag.mark_failed(
                    node.id,
                    ActorFailure::Graph(GraphError::UnknownWorkflow(node.workflow.clone())),
                );
                return;
            }
        };

        debug!(node = %node.name, workflow = %node.workflow, "spawning actor");
        let rt = NodeRuntime::new(
            node.id,
            node.name.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.kv),
            Arc::clone(&self.dag),
            Arc::clone(&self.registry),
            Arc::clone(&self.opts),
            node.deps,
            pipe,
        );
        let id = node.id;
        let body = spec.body;
        let handle = tasks.spawn(async move {
            let result = body.run(Arc::clone(&rt)).await;
            rt.shutdown().await;
            (id, result)
        });
        task_nodes.insert(handle.id(), id);
    }

    fn complete_node(&self, id: NodeId, result: Result<(), ActorFailure>) {
        let pipe = self.dag.node(id).and_then(|n| self.kv.get(&n.name));
        match result {
            Ok(()) => {
                if let Some(pipe) = pipe {
                    if !pipe.is_closed() {
                        pipe.close();
                    }
                }
                self.dag.mark_finished(id);
            }
            Err(failure) => {
                warn!(node = id.id(), error = %failure, "actor failed");
                if let Some(pipe) = pipe {
                    pipe.poison();
                }
                self.dag.mark_failed(id, failure);
            }
        }
    }

    fn end_terminal(&self) -> bool {
        let ids = match self.dag.resolve_alias(".end") {
            Ok(ids) if !ids.is_empty() => ids,
            _ => return false,
        };
        ids.iter().all(|&id| {
            self.dag
                .node(id)
                .map(|n| n.state.is_terminal())
                .unwrap_or(true)
        })
    }

    fn matches_stop(&self, stop: &str, id: NodeId, name: &str) -> bool {
        if name == stop {
            return true;
        }
        if let Some((base, _)) = name.rsplit_once('.') {
            if base == stop {
                return true;
            }
        }
        if self.dag.has_alias(stop) {
            if let Ok(ids) = self.dag.resolve_alias(stop) {
                return ids.contains(&id);
            }
        }
        false
    }
}
