// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Per-actor I/O facade.
//!
//! An actor body receives an `Arc<NodeRuntime>` and sees POSIX-like file
//! descriptors: the standard handles below auto-open on first use, further
//! fds come from `open_read`/`open_write`. Every failure sets an errno from
//! [`crate::errors::posix`] in addition to returning the error, so hosted
//! actors that only speak the C ABI observe the same codes.
//!
//! The default parameter (`""`) resolving to several dependency nodes is
//! presented as their outputs concatenated in declaration order; individual
//! inputs remain addressable with `open_read(param, idx)`.

mod dag_ops;
mod merge_reader;

pub use dag_ops::DagOps;
pub use merge_reader::MergeReader;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::environment::EnvOpts;
use crate::errors::{posix, IoError, KvError, PipeError};
use crate::graph::{DagStore, NodeId, ResolvedDep, WorkflowRegistry};
use crate::kv::KeyStore;
use crate::notify::NotificationQueue;
use crate::pipe::{Pipe, PipeWriter};

/// The standard file descriptors every actor starts with.
pub mod fd {
    pub const STDIN: i32 = 0;
    pub const STDOUT: i32 = 1;
    pub const LOG: i32 = 2;
    pub const ENV: i32 = 3;
    pub const METRICS: i32 = 4;
    pub const TRACE: i32 = 5;
}

const FIRST_DYNAMIC_FD: i32 = 6;

enum FdEntry {
    Reader(MergeReader),
    Writer(PipeWriter),
}

struct FdTable {
    fds: HashMap<i32, FdEntry>,
    next_fd: i32,
    /// fds created by `open_write_pipe`, mapped to their value nodes.
    fd_nodes: HashMap<i32, NodeId>,
}

/// The runtime one actor sees: its resolved inputs, its output pipe, and a
/// DAG-ops sub-facade for extending the graph.
pub struct NodeRuntime {
    node_id: NodeId,
    node_name: String,
    queue: Arc<NotificationQueue>,
    kv: Arc<KeyStore>,
    dag: Arc<DagStore>,
    registry: Arc<WorkflowRegistry>,
    opts: Arc<EnvOpts>,
    deps: Vec<ResolvedDep>,
    stdout: Arc<Pipe>,
    table: Mutex<FdTable>,
    errno: AtomicI32,
}

impl NodeRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        node_name: String,
        queue: Arc<NotificationQueue>,
        kv: Arc<KeyStore>,
        dag: Arc<DagStore>,
        registry: Arc<WorkflowRegistry>,
        opts: Arc<EnvOpts>,
        deps: Vec<ResolvedDep>,
        stdout: Arc<Pipe>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            node_name,
            queue,
            kv,
            dag,
            registry,
            opts,
            deps,
            stdout,
            table: Mutex::new(FdTable {
                fds: HashMap::new(),
                next_fd: FIRST_DYNAMIC_FD,
                fd_nodes: HashMap::new(),
            }),
            errno: AtomicI32::new(0),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// The last error code, POSIX style. Cleared on nothing; each failing
    /// call overwrites it.
    pub fn errno(&self) -> i32 {
        self.errno.load(Ordering::Acquire)
    }

    /// DAG-ops sub-facade for this actor.
    pub fn dag_ops(&self) -> DagOps<'_> {
        DagOps::new(self)
    }

    /// Number of inputs bound to a parameter.
    pub fn input_count(&self, param: &str) -> usize {
        self.deps.iter().filter(|d| d.param == param).count()
    }

    /// Open the `idx`-th input of `param` as its own fd.
    pub async fn open_read(&self, param: &str, idx: usize) -> Result<i32, IoError> {
        let dep = match self.deps.iter().filter(|d| d.param == param).nth(idx) {
            Some(dep) => dep.clone(),
            None => return Err(self.fail("open_read", posix::EINVAL)),
        };
        let reader = match self.kv.open_read(&dep.node_name) {
            Ok(reader) => reader,
            Err(KvError::NotFound(_)) => return Err(self.fail("open_read", posix::EIO)),
            Err(KvError::Exists(_)) => return Err(self.fail("open_read", posix::EINVAL)),
        };
        let mut table = self.table.lock().await;
        let fd = table.next_fd;
        table.next_fd += 1;
        table.fds.insert(fd, FdEntry::Reader(MergeReader::single(reader)));
        Ok(fd)
    }

    /// Open the output for writing. Only the default parameter refers to a
    /// real stream (stdout); anything else is `EINVAL`.
    pub async fn open_write(&self, param: &str) -> Result<i32, IoError> {
        if !param.is_empty() {
            return Err(self.fail("open_write", posix::EINVAL));
        }
        let mut table = self.table.lock().await;
        let fd = table.next_fd;
        table.next_fd += 1;
        table.fds.insert(fd, FdEntry::Writer(self.stdout.writer()));
        Ok(fd)
    }

    /// Read up to `buf.len()` bytes from `fd`. Returns 0 at end-of-stream.
    pub async fn read(&self, fd: i32, buf: &mut [u8]) -> Result<usize, IoError> {
        let mut table = self.table.lock().await;
        self.ensure_std(fd, &mut table).await?;
        match table.fds.get_mut(&fd) {
            Some(FdEntry::Reader(reader)) => match reader.read(buf).await {
                Ok(n) => Ok(n),
                Err(e) => Err(self.fail_pipe("read", e)),
            },
            Some(FdEntry::Writer(_)) => Err(self.fail("read", posix::EBADF)),
            None => Err(self.fail("read", posix::EBADF)),
        }
    }

    /// Write `data` to `fd`.
    pub async fn write(&self, fd: i32, data: &[u8]) -> Result<usize, IoError> {
        let mut table = self.table.lock().await;
        self.ensure_std(fd, &mut table).await?;
        let value_node = table.fd_nodes.get(&fd).copied();
        match table.fds.get_mut(&fd) {
            Some(FdEntry::Writer(writer)) => match writer.write(data).await {
                Ok(n) => {
                    if n > 0 {
                        if let Some(node) = value_node {
                            self.dag.mark_progressed(node);
                        }
                    }
                    Ok(n)
                }
                Err(e) => Err(self.fail_pipe("write", e)),
            },
            Some(FdEntry::Reader(_)) => Err(self.fail("write", posix::EBADF)),
            None => Err(self.fail("write", posix::EBADF)),
        }
    }

    /// Close a dynamic fd. The standard fds stay open for the lifetime of
    /// the actor and closing them is a no-op.
    pub async fn close(&self, fd: i32) -> Result<(), IoError> {
        if (fd::STDIN..=fd::TRACE).contains(&fd) {
            return Ok(());
        }
        let mut table = self.table.lock().await;
        // The fd-to-node binding outlives the close so `alias_fd` can still
        // name the (now finished) value node.
        let value_node = table.fd_nodes.get(&fd).copied();
        match table.fds.remove(&fd) {
            Some(FdEntry::Reader(mut reader)) => {
                reader.close();
                Ok(())
            }
            Some(FdEntry::Writer(writer)) => {
                writer.close();
                if let Some(node) = value_node {
                    // Sealing an open value node makes it a finished value.
                    self.dag.mark_finished(node);
                }
                Ok(())
            }
            None => Err(self.fail("close", posix::EBADF)),
        }
    }

    /// Drain `fd` to end-of-stream.
    pub async fn read_all(&self, fd: i32) -> Result<Vec<u8>, IoError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read(fd, &mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Write the whole buffer to `fd`.
    pub async fn write_all(&self, fd: i32, data: &[u8]) -> Result<(), IoError> {
        self.write(fd, data).await.map(|_| ())
    }

    /// Close everything except stdout, which the scheduler seals so it can
    /// poison it on failure.
    pub async fn shutdown(&self) {
        let mut table = self.table.lock().await;
        let fd_nodes: Vec<NodeId> = table.fd_nodes.values().copied().collect();
        for (_, entry) in table.fds.drain() {
            match entry {
                FdEntry::Reader(mut reader) => reader.close(),
                FdEntry::Writer(writer) => {
                    if Arc::ptr_eq(writer.pipe(), &self.stdout) {
                        continue;
                    }
                    if !writer.is_closed() {
                        writer.close();
                    }
                }
            }
        }
        for node in fd_nodes {
            self.dag.mark_finished(node);
        }
        debug!(node = %self.node_name, "runtime shut down");
    }

    pub(crate) fn dag_store(&self) -> &Arc<DagStore> {
        &self.dag
    }

    pub(crate) fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    async fn ensure_std(&self, fd: i32, table: &mut FdTable) -> Result<(), IoError> {
        if table.fds.contains_key(&fd) || !(fd::STDIN..=fd::TRACE).contains(&fd) {
            return Ok(());
        }
        match fd {
            fd::STDIN => {
                let mut readers = Vec::new();
                for dep in self.deps.iter().filter(|d| d.param.is_empty()) {
                    match self.kv.open_read(&dep.node_name) {
                        Ok(reader) => readers.push(reader),
                        Err(_) => return Err(self.fail("read", posix::EIO)),
                    }
                }
                table.fds.insert(fd, FdEntry::Reader(MergeReader::new(readers)));
            }
            fd::STDOUT => {
                table.fds.insert(fd, FdEntry::Writer(self.stdout.writer()));
            }
            fd::LOG | fd::METRICS | fd::TRACE => {
                let suffix = match fd {
                    fd::LOG => "log",
                    fd::METRICS => "metrics",
                    _ => "trace",
                };
                let key = format!("{}.{}", self.node_name, suffix);
                let writer = match self.kv.open_write(&key) {
                    Ok(writer) => writer,
                    Err(_) => return Err(self.fail("write", posix::EIO)),
                };
                table.fds.insert(fd, FdEntry::Writer(writer));
            }
            fd::ENV => {
                let pipe = Pipe::new(&self.queue, &format!("{}.env", self.node_name));
                pipe.write_now(&self.opts.to_bytes())
                    .expect("fresh env pipe accepts writes");
                pipe.close();
                table
                    .fds
                    .insert(fd, FdEntry::Reader(MergeReader::single(pipe.open_reader())));
            }
            _ => unreachable!("std fd range checked above"),
        }
        Ok(())
    }

    pub(crate) async fn install_writer(&self, writer: PipeWriter, node: NodeId) -> i32 {
        let mut table = self.table.lock().await;
        let fd = table.next_fd;
        table.next_fd += 1;
        table.fds.insert(fd, FdEntry::Writer(writer));
        table.fd_nodes.insert(fd, node);
        fd
    }

    pub(crate) async fn node_for_fd(&self, fd: i32) -> Option<NodeId> {
        self.table.lock().await.fd_nodes.get(&fd).copied()
    }

    fn fail(&self, op: &'static str, errno: i32) -> IoError {
        self.errno.store(errno, Ordering::Release);
        debug!(node = %self.node_name, op, errno, "runtime error");
        IoError::new(op, errno)
    }

    fn fail_pipe(&self, op: &'static str, e: PipeError) -> IoError {
        self.fail(op, e.errno())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::posix;
    use crate::graph::SourceRef;

    struct Fixture {
        queue: Arc<NotificationQueue>,
        kv: Arc<KeyStore>,
        dag: Arc<DagStore>,
    }

    fn fixture() -> Fixture {
        let queue = Arc::new(NotificationQueue::new());
        let kv = Arc::new(KeyStore::new(Arc::clone(&queue)));
        let dag = Arc::new(DagStore::new(Arc::clone(&queue), Arc::clone(&kv)));
        Fixture { queue, kv, dag }
    }

    fn runtime_for(fix: &Fixture, deps: Vec<ResolvedDep>) -> (Arc<NodeRuntime>, Arc<Pipe>) {
        let stdout = Pipe::new(&fix.queue, "test.stdout");
        fix.kv
            .put_pipe("actor.under.test", Arc::clone(&stdout))
            .unwrap();
        let id = fix.queue.register("test node");
        let rt = NodeRuntime::new(
            id,
            "actor.under.test".to_string(),
            Arc::clone(&fix.queue),
            Arc::clone(&fix.kv),
            Arc::clone(&fix.dag),
            Arc::new(WorkflowRegistry::new()),
            Arc::new(EnvOpts::new()),
            deps,
            Arc::clone(&stdout),
        );
        (rt, stdout)
    }

    fn dep_for(fix: &Fixture, param: &str, bytes: &[u8]) -> ResolvedDep {
        let id = fix.dag.add_value_node(bytes, None).unwrap();
        let node = fix.dag.node(id).unwrap();
        ResolvedDep {
            param: param.to_string(),
            node_id: id,
            node_name: node.name,
        }
    }

    #[tokio::test]
    async fn test_stdin_concatenates_default_inputs() {
        let fix = fixture();
        let deps = vec![dep_for(&fix, "", b"Hello"), dep_for(&fix, "", b" world")];
        let (rt, _stdout) = runtime_for(&fix, deps);

        let bytes = rt.read_all(fd::STDIN).await.unwrap();
        assert_eq!(bytes, b"Hello world");
    }

    #[tokio::test]
    async fn test_open_read_by_index() {
        let fix = fixture();
        let deps = vec![dep_for(&fix, "", b"one"), dep_for(&fix, "", b"two")];
        let (rt, _stdout) = runtime_for(&fix, deps);

        let fd = rt.open_read("", 1).await.unwrap();
        assert_eq!(rt.read_all(fd).await.unwrap(), b"two");
        rt.close(fd).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_read_bad_index_sets_einval() {
        let fix = fixture();
        let (rt, _stdout) = runtime_for(&fix, vec![]);
        let err = rt.open_read("", 0).await.unwrap_err();
        assert_eq!(err.errno, posix::EINVAL);
        assert_eq!(rt.errno(), posix::EINVAL);
    }

    #[tokio::test]
    async fn test_write_goes_to_stdout_pipe() {
        let fix = fixture();
        let (rt, stdout) = runtime_for(&fix, vec![]);

        rt.write_all(fd::STDOUT, b"output").await.unwrap();
        assert_eq!(stdout.contents(), b"output");
    }

    #[tokio::test]
    async fn test_unknown_fd_is_ebadf() {
        let fix = fixture();
        let (rt, _stdout) = runtime_for(&fix, vec![]);
        let mut buf = [0u8; 4];
        assert_eq!(rt.read(99, &mut buf).await.unwrap_err().errno, posix::EBADF);
        assert_eq!(rt.write(99, b"x").await.unwrap_err().errno, posix::EBADF);
    }

    #[tokio::test]
    async fn test_read_on_writer_fd_is_ebadf() {
        let fix = fixture();
        let (rt, _stdout) = runtime_for(&fix, vec![]);
        let mut buf = [0u8; 4];
        assert_eq!(
            rt.read(fd::STDOUT, &mut buf).await.unwrap_err().errno,
            posix::EBADF
        );
    }

    #[tokio::test]
    async fn test_write_after_close_is_epipe() {
        let fix = fixture();
        let (rt, stdout) = runtime_for(&fix, vec![]);
        stdout.close();
        let err = rt.write(fd::STDOUT, b"late").await.unwrap_err();
        assert_eq!(err.errno, posix::EPIPE);
    }

    #[tokio::test]
    async fn test_poisoned_upstream_reads_eio() {
        let fix = fixture();
        // A dependency whose pipe is poisoned mid-stream.
        let bad = Pipe::new(&fix.queue, "failed.node");
        fix.kv.put_pipe("failed.node.1", Arc::clone(&bad)).unwrap();
        bad.poison();
        let ghost = fix.queue.register("failed node");
        let deps = vec![ResolvedDep {
            param: String::new(),
            node_id: ghost,
            node_name: "failed.node.1".to_string(),
        }];
        let (rt, _stdout) = runtime_for(&fix, deps);

        let err = rt.read_all(fd::STDIN).await.unwrap_err();
        assert_eq!(err.errno, posix::EIO);
        assert_eq!(rt.errno(), posix::EIO);
    }

    #[tokio::test]
    async fn test_env_fd_serves_opts_json() {
        let fix = fixture();
        let opts = Arc::new(EnvOpts::new());
        opts.set("llm.model", serde_json::json!("gpt"));

        let stdout = Pipe::new(&fix.queue, "env.test.stdout");
        let id = fix.queue.register("env test");
        let rt = NodeRuntime::new(
            id,
            "env.test".to_string(),
            Arc::clone(&fix.queue),
            Arc::clone(&fix.kv),
            Arc::clone(&fix.dag),
            Arc::new(WorkflowRegistry::new()),
            opts,
            vec![],
            stdout,
        );

        let bytes = rt.read_all(fd::ENV).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["llm.model"], "gpt");
    }

    #[tokio::test]
    async fn test_trace_fd_lands_in_kv() {
        let fix = fixture();
        let (rt, _stdout) = runtime_for(&fix, vec![]);
        rt.write_all(fd::TRACE, b"span start").await.unwrap();
        rt.shutdown().await;

        let mut reader = fix.kv.open_read("actor.under.test.trace").unwrap();
        assert_eq!(reader.read_to_end().await.unwrap(), b"span start");
    }

    #[tokio::test]
    async fn test_open_write_pipe_produces_finished_value_node() {
        let fix = fixture();
        let (rt, _stdout) = runtime_for(&fix, vec![]);

        let ops = rt.dag_ops();
        let fd = ops.open_write_pipe(Some("fork output")).await.unwrap();
        rt.write_all(fd, b"forked").await.unwrap();

        let node_id = rt.node_for_fd(fd).await.unwrap();
        rt.close(fd).await.unwrap();

        let node = fix.dag.node(node_id).unwrap();
        assert_eq!(node.state, crate::graph::NodeState::Finished);
        let mut reader = fix.kv.open_read(&node.name).unwrap();
        assert_eq!(reader.read_to_end().await.unwrap(), b"forked");
    }

    #[tokio::test]
    async fn test_alias_fd_binds_value_node() {
        let fix = fixture();
        let (rt, _stdout) = runtime_for(&fix, vec![]);

        let ops = rt.dag_ops();
        let fd = ops.open_write_pipe(None).await.unwrap();
        rt.write_all(fd, b"tool output").await.unwrap();
        rt.close(fd).await.unwrap();
        ops.alias_fd(".forked", fd).await.unwrap();

        let resolved = fix.dag.resolve(&SourceRef::Alias(".forked".into())).unwrap();
        assert_eq!(resolved.len(), 1);
    }
}
