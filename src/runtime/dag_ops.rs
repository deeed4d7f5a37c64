//! DAG-ops sub-facade handed to actors.
//!
//! Everything here calls straight into the DAG store, holding its lock only
//! for the duration of the call. This is the surface that makes loop
//! unrolling possible: an actor detaches an alias, appends value nodes,
//! grafts a continuation template, and re-points `.end`.

use std::collections::HashMap;

use crate::errors::GraphError;
use crate::graph::{NodeId, SourceRef};
use crate::runtime::NodeRuntime;

/// Graph operations scoped to one running actor.
pub struct DagOps<'a> {
    rt: &'a NodeRuntime,
}

impl<'a> DagOps<'a> {
    pub(crate) fn new(rt: &'a NodeRuntime) -> Self {
        Self { rt }
    }

    /// Add a finished node over fixed bytes.
    pub fn value_node(&self, bytes: &[u8], explain: Option<&str>) -> Result<NodeId, GraphError> {
        self.rt.dag_store().add_value_node(bytes, explain)
    }

    /// Append a node to an alias (created if absent).
    pub fn alias(&self, name: &str, node: NodeId) -> Result<(), GraphError> {
        self.rt.dag_store().alias(name, Some(SourceRef::Node(node)))
    }

    /// Replace an alias's targets with a single node.
    pub fn realias(&self, name: &str, node: NodeId) -> Result<(), GraphError> {
        self.rt.dag_store().realias(name, SourceRef::Node(node))
    }

    /// Freeze the alias into every node currently depending on it.
    pub fn detach_from_alias(&self, name: &str) -> Result<(), GraphError> {
        self.rt.dag_store().detach_from_alias(name)
    }

    /// Graft a workflow template; returns the sink node id.
    pub fn instantiate_with_deps(
        &self,
        workflow: &str,
        deps_map: HashMap<String, SourceRef>,
    ) -> Result<NodeId, GraphError> {
        self.rt
            .dag_store()
            .instantiate_with_deps(self.rt.registry(), workflow, &deps_map)
    }

    /// Create a value-like node fed through an fd. Closing the fd seals the
    /// node into a finished value.
    pub async fn open_write_pipe(&self, explain: Option<&str>) -> Result<i32, GraphError> {
        let (node, pipe) = self.rt.dag_store().add_open_value_node(explain)?;
        let fd = self.rt.install_writer(pipe.writer(), node).await;
        Ok(fd)
    }

    /// Bind the value node behind an `open_write_pipe` fd to an alias.
    /// Legal before or after the fd is closed; a closed fd simply yields a
    /// finished value node.
    pub async fn alias_fd(&self, name: &str, fd: i32) -> Result<(), GraphError> {
        let node = match self.rt.node_for_fd(fd).await {
            Some(node) => node,
            None => return Err(GraphError::UnknownNode(format!("fd {}", fd))),
        };
        self.alias(name, node)
    }
}
