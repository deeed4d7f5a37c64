// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use crate::notify::Handle;

/// POSIX errno values that form the stable actor-runtime contract.
///
/// Actor bodies see these through `NodeRuntime::errno()`; the numeric values
/// match the Linux definitions so foreign-hosted actors can reuse libc
/// constants unchanged.
pub mod posix {
    /// I/O error: the upstream node failed (poisoned pipe).
    pub const EIO: i32 = 5;
    /// Unknown file descriptor.
    pub const EBADF: i32 = 9;
    /// Non-blocking read would block. Reserved, not raised today.
    pub const EAGAIN: i32 = 11;
    /// Bad parameter name or input index.
    pub const EINVAL: i32 = 22;
    /// Soft buffer cap exceeded on a synchronous write path.
    pub const ENOSPC: i32 = 28;
    /// Write after close.
    pub const EPIPE: i32 = 32;
}

/// Errors surfaced by the notification queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The handle was never minted by this queue (handle 0 included)
    Unregistered(Handle),

    /// Too many concurrent waiters on one handle
    WaiterLimit { handle: Handle, limit: usize },

    /// Too many subscribers on one handle
    SubscriberLimit { handle: Handle, limit: usize },

    /// A bounded subscription fell behind and dropped notifications
    Overflow { handle: Handle, missed: u64 },
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Unregistered(handle) => {
                write!(f, "Handle {} was never registered", handle)
            }
            QueueError::WaiterLimit { handle, limit } => {
                write!(f, "Waiter limit ({}) exceeded for handle {}", limit, handle)
            }
            QueueError::SubscriberLimit { handle, limit } => {
                write!(
                    f,
                    "Subscriber limit ({}) exceeded for handle {}",
                    limit, handle
                )
            }
            QueueError::Overflow { handle, missed } => {
                write!(
                    f,
                    "Subscription on handle {} overflowed, {} notifications dropped",
                    handle, missed
                )
            }
        }
    }
}

impl std::error::Error for QueueError {}

/// Errors surfaced by pipe reads and writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeError {
    /// Write attempted after the writer closed the pipe
    ClosedPipe,

    /// The producing node failed; the buffer drained, there is no clean EOS
    Poisoned,

    /// A synchronous write would exceed the configured soft cap
    CapExceeded,

    /// Notification plumbing failed underneath the pipe
    Queue(QueueError),
}

impl PipeError {
    /// The errno an actor observes for this error
    pub fn errno(&self) -> i32 {
        match self {
            PipeError::ClosedPipe => posix::EPIPE,
            PipeError::Poisoned => posix::EIO,
            PipeError::CapExceeded => posix::ENOSPC,
            PipeError::Queue(_) => posix::EIO,
        }
    }
}

impl std::fmt::Display for PipeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipeError::ClosedPipe => write!(f, "Write on a closed pipe"),
            PipeError::Poisoned => write!(f, "Pipe poisoned by a failed producer"),
            PipeError::CapExceeded => write!(f, "Pipe soft cap exceeded"),
            PipeError::Queue(e) => write!(f, "Pipe notification failed: {}", e),
        }
    }
}

impl std::error::Error for PipeError {}

impl From<QueueError> for PipeError {
    fn from(e: QueueError) -> Self {
        PipeError::Queue(e)
    }
}

/// Errors surfaced by the key-stream store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    /// No entry under the key
    NotFound(String),

    /// The key is already bound to a pipe
    Exists(String),
}

impl std::fmt::Display for KvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KvError::NotFound(key) => write!(f, "Key '{}' not found in store", key),
            KvError::Exists(key) => write!(f, "Key '{}' already exists in store", key),
        }
    }
}

impl std::error::Error for KvError {}

/// Errors reported synchronously from DAG operations.
///
/// These never poison nodes; the caller decides how to proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// A dependency or alias target names a node that does not exist
    UnknownNode(String),

    /// A dependency names an alias that was never created
    UnknownAlias(String),

    /// Alias resolution revisited an alias (A -> B -> A)
    AliasCycle(String),

    /// Adding the edge would make the target reachable from itself
    CycleDetected { from: String, to: String },

    /// The plugin table has no template under this workflow name
    UnknownWorkflow(String),

    /// A restored node name collides with an existing node
    NameTaken(String),
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphError::UnknownNode(name) => write!(f, "Node '{}' not found", name),
            GraphError::UnknownAlias(alias) => write!(f, "Alias '{}' not found", alias),
            GraphError::AliasCycle(alias) => {
                write!(f, "Alias cycle detected while resolving '{}'", alias)
            }
            GraphError::CycleDetected { from, to } => {
                write!(
                    f,
                    "Dependency from '{}' to '{}' would close a cycle",
                    from, to
                )
            }
            GraphError::UnknownWorkflow(workflow) => {
                write!(f, "Workflow '{}' not found in plugin table", workflow)
            }
            GraphError::NameTaken(name) => {
                write!(f, "Node name '{}' is already taken", name)
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// An actor-runtime I/O error with its POSIX face
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoError {
    pub errno: i32,
    pub op: &'static str,
}

impl IoError {
    pub fn new(op: &'static str, errno: i32) -> Self {
        Self { errno, op }
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed with errno {}", self.op, self.errno)
    }
}

impl std::error::Error for IoError {}

/// Any uncaught failure inside an actor body.
///
/// The scheduler turns this into a `Failed` node and poisons its output;
/// downstream readers observe `EIO` and decide for themselves whether to
/// surface a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorFailure {
    /// I/O against the node runtime failed
    Io(IoError),

    /// A DAG operation failed inside the actor
    Graph(GraphError),

    /// The actor could not make sense of its input
    Malformed(String),

    /// The actor body panicked
    Panicked(String),

    /// Anything else the actor wants to report
    Other(String),
}

impl std::fmt::Display for ActorFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorFailure::Io(e) => write!(f, "Actor I/O error: {}", e),
            ActorFailure::Graph(e) => write!(f, "Actor DAG operation failed: {}", e),
            ActorFailure::Malformed(reason) => write!(f, "Malformed actor input: {}", reason),
            ActorFailure::Panicked(reason) => write!(f, "Actor panicked: {}", reason),
            ActorFailure::Other(reason) => write!(f, "Actor failed: {}", reason),
        }
    }
}

impl std::error::Error for ActorFailure {}

impl From<IoError> for ActorFailure {
    fn from(e: IoError) -> Self {
        ActorFailure::Io(e)
    }
}

impl From<GraphError> for ActorFailure {
    fn from(e: GraphError) -> Self {
        ActorFailure::Graph(e)
    }
}

impl From<serde_json::Error> for ActorFailure {
    fn from(e: serde_json::Error) -> Self {
        ActorFailure::Malformed(e.to_string())
    }
}
