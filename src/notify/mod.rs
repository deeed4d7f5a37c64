// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Handle-keyed notification queue bridging worker threads to cooperative waiters.
//!
//! Every waitable entity in the system — a pipe writer end, a reader end, a
//! DAG node, the graph-changed event — is identified by a [`Handle`] minted
//! here. Producers call [`NotificationQueue::notify`] from any thread;
//! consumers either [`wait`](NotificationQueue::wait) (one-shot suspension)
//! or [`subscribe`](NotificationQueue::subscribe) (bounded broadcast channel).
//!
//! # Lost-wakeup protocol
//!
//! A waiter that samples some condition and then registers interest can miss
//! a notification fired in between. The guarded-wait workflow closes the gap:
//!
//! ```ignore
//! if should_wait() {
//!     let guard = queue.lock();
//!     if should_wait() {
//!         // interest is registered while the guard is held; the guard is
//!         // consumed and released before the future is awaited
//!         queue.wait_guarded(handle, "reader", guard).await?;
//!     }
//! }
//! ```
//!
//! `notify` takes the same lock before extracting the waiter set, so a
//! notification either sees the registered waiter or happens-before the
//! re-check. Waiters are always woken outside the lock.

use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::errors::QueueError;

/// Payload delivered when a handle is retired.
pub const CLOSE_PAYLOAD: i32 = -1;

/// Upper bound on concurrent one-shot waiters per handle.
pub const MAX_WAITERS_PER_HANDLE: usize = 64;

/// Upper bound on live subscriptions per handle.
pub const MAX_SUBSCRIBERS_PER_HANDLE: usize = 64;

/// A 32-bit identifier for something that can be waited on.
///
/// Handle 0 is the reserved "never fires" handle; real handles are allocated
/// monotonically and never reused within one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// The reserved handle that never fires.
    pub const NEVER: Handle = Handle(0);

    pub fn id(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Waiter {
    tx: oneshot::Sender<i32>,
    debug_hint: String,
}

struct Topic {
    debug_hint: String,
    waiters: Vec<Waiter>,
    broadcast: Option<broadcast::Sender<i32>>,
}

/// Internal queue state. Public only so the guard type can name it.
pub struct QueueState {
    next_id: u32,
    topics: HashMap<Handle, Topic>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            next_id: 1,
            topics: HashMap::new(),
        }
    }
}

/// Thread-safe, handle-keyed wake-up primitive.
pub struct NotificationQueue {
    state: Mutex<QueueState>,
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::new()),
        }
    }

    /// Mint a new handle.
    pub fn register(&self, debug_hint: &str) -> Handle {
        let mut state = self.state.lock();
        let handle = Handle(state.next_id);
        state.next_id += 1;
        state.topics.insert(
            handle,
            Topic {
                debug_hint: debug_hint.to_string(),
                waiters: Vec::new(),
                broadcast: None,
            },
        );
        debug!(handle = handle.id(), hint = debug_hint, "handle registered");
        handle
    }

    /// Bump the allocator so no future handle has an id at or below `id`.
    ///
    /// Used when restoring state whose node names embed ids from a prior run.
    pub fn reserve_up_to(&self, id: u32) {
        let mut state = self.state.lock();
        if state.next_id <= id {
            state.next_id = id + 1;
        }
    }

    /// Retire a handle: every waiter and subscriber is woken with
    /// [`CLOSE_PAYLOAD`], then the topic is dropped. Further `notify` calls
    /// on a retired handle are no-ops.
    pub fn unregister(&self, handle: Handle) {
        match self.dispatch(handle, CLOSE_PAYLOAD, true) {
            Ok(_) => {}
            Err(e) => warn!(handle = handle.id(), error = %e, "unregister on unknown handle"),
        }
    }

    /// Wake everyone interested in `handle` with `payload`.
    ///
    /// Callable from any thread, including OS threads doing blocking
    /// syscalls; never blocks on slow consumers. Returns the number of
    /// parties woken. Notifying a retired handle returns `Ok(0)`; notifying
    /// a handle that was never minted is [`QueueError::Unregistered`].
    pub fn notify(&self, handle: Handle, payload: i32) -> Result<usize, QueueError> {
        self.dispatch(handle, payload, false)
    }

    /// Acquire the queue lock for the guarded-wait protocol.
    pub fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock()
    }

    /// Register interest in `handle` while `guard` is held, then wait.
    ///
    /// The guard is consumed and released before the returned future is
    /// awaited, so the caller's condition re-check and the interest
    /// registration are atomic with respect to `notify`. Resolves with the
    /// notification payload; a retired handle resolves immediately with
    /// [`CLOSE_PAYLOAD`].
    pub fn wait_guarded(
        &self,
        handle: Handle,
        debug_hint: &str,
        mut guard: MutexGuard<'_, QueueState>,
    ) -> impl std::future::Future<Output = Result<i32, QueueError>> + Send + 'static {
        enum Armed {
            Failed(QueueError),
            Ready(i32),
            Waiting(oneshot::Receiver<i32>),
        }

        let armed = if let Some(topic) = guard.topics.get_mut(&handle) {
            if topic.waiters.len() >= MAX_WAITERS_PER_HANDLE {
                Armed::Failed(QueueError::WaiterLimit {
                    handle,
                    limit: MAX_WAITERS_PER_HANDLE,
                })
            } else {
                let (tx, rx) = oneshot::channel();
                topic.waiters.push(Waiter {
                    tx,
                    debug_hint: debug_hint.to_string(),
                });
                Armed::Waiting(rx)
            }
        } else if handle == Handle::NEVER || handle.id() >= guard.next_id {
            Armed::Failed(QueueError::Unregistered(handle))
        } else {
            // Retired handle: resolve immediately rather than wait forever.
            Armed::Ready(CLOSE_PAYLOAD)
        };
        drop(guard);

        async move {
            match armed {
                Armed::Failed(e) => Err(e),
                Armed::Ready(payload) => Ok(payload),
                // A dropped sender means the whole queue went away mid-wait;
                // report it as a close.
                Armed::Waiting(rx) => Ok(rx.await.unwrap_or(CLOSE_PAYLOAD)),
            }
        }
    }

    /// Wait for the next notification on `handle`.
    pub async fn wait(&self, handle: Handle, debug_hint: &str) -> Result<i32, QueueError> {
        let guard = self.lock();
        self.wait_guarded(handle, debug_hint, guard).await
    }

    /// Like [`wait`](Self::wait), but give up after `timeout`.
    ///
    /// Returns `Ok(None)` on timeout. Timeouts are not a core concept; this
    /// is the hook actor-level wrappers layer deadlines on.
    pub async fn wait_timeout(
        &self,
        handle: Handle,
        debug_hint: &str,
        timeout: std::time::Duration,
    ) -> Result<Option<i32>, QueueError> {
        match tokio::time::timeout(timeout, self.wait(handle, debug_hint)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Subscribe to every future notification on `handle`.
    ///
    /// Delivery is through a bounded channel: a subscriber that falls more
    /// than `capacity` notifications behind observes
    /// [`QueueError::Overflow`] instead of silently losing events.
    pub fn subscribe(
        &self,
        handle: Handle,
        capacity: usize,
        debug_hint: &str,
    ) -> Result<Subscription, QueueError> {
        let mut state = self.state.lock();
        let topic = match state.topics.get_mut(&handle) {
            Some(topic) => topic,
            None => return Err(QueueError::Unregistered(handle)),
        };
        if topic.broadcast.is_none() {
            let (tx, _rx) = broadcast::channel(capacity.max(1));
            topic.broadcast = Some(tx);
        }
        let sender = topic.broadcast.as_ref().expect("installed above");
        if sender.receiver_count() >= MAX_SUBSCRIBERS_PER_HANDLE {
            return Err(QueueError::SubscriberLimit {
                handle,
                limit: MAX_SUBSCRIBERS_PER_HANDLE,
            });
        }
        let rx = sender.subscribe();
        debug!(
            handle = handle.id(),
            hint = debug_hint,
            topic = %topic.debug_hint,
            "subscription created"
        );
        Ok(Subscription { handle, rx })
    }

    /// Tear the queue down: retire every live handle.
    ///
    /// Suspended waiters resume with [`CLOSE_PAYLOAD`]; subscribers see the
    /// close and then end-of-channel.
    pub fn shutdown(&self) {
        let handles: Vec<Handle> = {
            let state = self.state.lock();
            state.topics.keys().copied().collect()
        };
        for handle in handles {
            self.unregister(handle);
        }
    }

    fn dispatch(&self, handle: Handle, payload: i32, retire: bool) -> Result<usize, QueueError> {
        // Extract the interested parties under the lock, wake them outside it.
        let (waiters, broadcaster) = {
            let mut state = self.state.lock();
            if !state.topics.contains_key(&handle) {
                if handle == Handle::NEVER || handle.id() >= state.next_id {
                    return Err(QueueError::Unregistered(handle));
                }
                return Ok(0);
            }
            if retire {
                let topic = state.topics.remove(&handle).expect("checked above");
                debug!(handle = handle.id(), hint = %topic.debug_hint, "handle retired");
                (topic.waiters, topic.broadcast)
            } else {
                let topic = state.topics.get_mut(&handle).expect("checked above");
                (std::mem::take(&mut topic.waiters), topic.broadcast.clone())
            }
        };

        let mut woken = 0;
        for waiter in waiters {
            if waiter.tx.send(payload).is_ok() {
                woken += 1;
            } else {
                // Waiter dropped before the notification fired; nothing leaks,
                // the registration was already removed above.
                debug!(
                    handle = handle.id(),
                    hint = %waiter.debug_hint,
                    "waiter gone before notify"
                );
            }
        }
        if let Some(tx) = broadcaster {
            woken += tx.send(payload).unwrap_or(0);
        }
        Ok(woken)
    }
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of [`NotificationQueue::subscribe`].
pub struct Subscription {
    handle: Handle,
    rx: broadcast::Receiver<i32>,
}

impl Subscription {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Receive the next notification payload.
    ///
    /// Returns [`CLOSE_PAYLOAD`] once the handle is retired and the channel
    /// drained; overflow is surfaced as an error, not a silent drop.
    pub async fn recv(&mut self) -> Result<i32, QueueError> {
        match self.rx.recv().await {
            Ok(payload) => Ok(payload),
            Err(broadcast::error::RecvError::Lagged(missed)) => Err(QueueError::Overflow {
                handle: self.handle,
                missed,
            }),
            Err(broadcast::error::RecvError::Closed) => Ok(CLOSE_PAYLOAD),
        }
    }
}
