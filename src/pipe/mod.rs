// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Broadcast byte pipe: one writer, many readers, monotonic buffer.
//!
//! A pipe is the output stream of one DAG node. The writer appends bytes and
//! notifies the pipe's progress handle; each reader keeps its own position
//! and suspends on the same handle when it catches up. Readers that join
//! late start at offset 0 and observe exactly the bytes every other reader
//! observed (the buffer is never truncated).
//!
//! Closing is explicit and happens once. A pipe whose producer failed is
//! *poisoned*: readers drain whatever was written, then get
//! [`PipeError::Poisoned`] instead of a clean end-of-stream.
//!
//! Pipes are unbounded by default. [`Pipe::with_cap`] installs a soft cap:
//! the async writer suspends until the slowest reader advances, and bytes
//! are never discarded.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::errors::PipeError;
use crate::notify::{Handle, NotificationQueue};

struct Shared {
    buffer: Vec<u8>,
    closed: bool,
    poisoned: bool,
    /// Positions of live readers, tracked only while a soft cap is in force.
    reader_pos: HashMap<Handle, usize>,
}

/// A single-producer, multi-consumer byte stream.
pub struct Pipe {
    shared: Mutex<Shared>,
    handle: Handle,
    /// Present iff a soft cap is configured; the writer parks here.
    drain: Option<Handle>,
    cap: Option<usize>,
    queue: Arc<NotificationQueue>,
    debug_hint: String,
}

impl Pipe {
    /// Create an unbounded pipe. The progress handle is registered with the
    /// queue immediately so subscribers can attach before the first byte.
    pub fn new(queue: &Arc<NotificationQueue>, debug_hint: &str) -> Arc<Pipe> {
        Self::build(queue, debug_hint, None)
    }

    /// Create a pipe with a soft cap on unconsumed bytes.
    pub fn with_cap(queue: &Arc<NotificationQueue>, debug_hint: &str, cap: usize) -> Arc<Pipe> {
        Self::build(queue, debug_hint, Some(cap))
    }

    fn build(queue: &Arc<NotificationQueue>, debug_hint: &str, cap: Option<usize>) -> Arc<Pipe> {
        let handle = queue.register(&format!("pipe.writer {}", debug_hint));
        let drain = cap.map(|_| queue.register(&format!("pipe.drain {}", debug_hint)));
        Arc::new(Pipe {
            shared: Mutex::new(Shared {
                buffer: Vec::new(),
                closed: false,
                poisoned: false,
                reader_pos: HashMap::new(),
            }),
            handle,
            drain,
            cap,
            queue: Arc::clone(queue),
            debug_hint: debug_hint.to_string(),
        })
    }

    /// The progress handle: notified with the byte count of every write and
    /// retired on close.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn is_poisoned(&self) -> bool {
        self.shared.lock().poisoned
    }

    /// Copy of the full buffer, for snapshots.
    pub fn contents(&self) -> Vec<u8> {
        self.shared.lock().buffer.clone()
    }

    /// The writer end. One writer per pipe by contract: the node that owns
    /// the output.
    pub fn writer(self: &Arc<Self>) -> PipeWriter {
        PipeWriter {
            pipe: Arc::clone(self),
        }
    }

    /// Attach a reader starting at offset 0.
    pub fn open_reader(self: &Arc<Self>) -> PipeReader {
        let handle = self
            .queue
            .register(&format!("pipe.reader {}", self.debug_hint));
        if self.cap.is_some() {
            self.shared.lock().reader_pos.insert(handle, 0);
        }
        PipeReader {
            own_handle: handle,
            pipe: Arc::clone(self),
            pos: 0,
            closed: false,
        }
    }

    /// Close the pipe. Idempotent; a second close is logged and ignored.
    pub fn close(&self) {
        {
            let mut shared = self.shared.lock();
            if shared.closed {
                warn!(pipe = %self.debug_hint, "close on already closed pipe");
                return;
            }
            shared.closed = true;
        }
        // Retiring the handle wakes every parked reader with CLOSE_PAYLOAD.
        self.queue.unregister(self.handle);
        if let Some(drain) = self.drain {
            self.queue.unregister(drain);
        }
    }

    /// Mark the producer as failed and close. Readers drain the buffer and
    /// then observe [`PipeError::Poisoned`].
    pub fn poison(&self) {
        {
            let mut shared = self.shared.lock();
            shared.poisoned = true;
        }
        self.close();
    }

    /// Synchronous append for writers that cannot suspend (value nodes,
    /// state restore). Fails with [`PipeError::CapExceeded`] instead of
    /// waiting when a soft cap is in force.
    pub fn write_now(&self, data: &[u8]) -> Result<usize, PipeError> {
        {
            let mut shared = self.shared.lock();
            if shared.closed {
                return Err(PipeError::ClosedPipe);
            }
            if let Some(cap) = self.cap {
                if Self::outstanding(&shared) + data.len() > cap {
                    return Err(PipeError::CapExceeded);
                }
            }
            shared.buffer.extend_from_slice(data);
        }
        // Zero-length writes still notify: a waiter may be watching for
        // progress, not bytes.
        self.queue.notify(self.handle, clamp_len(data.len()))?;
        Ok(data.len())
    }

    /// Bytes not yet consumed by the slowest reader. With no readers
    /// attached there is nobody to wait for, so nothing is outstanding.
    fn outstanding(shared: &Shared) -> usize {
        match shared.reader_pos.values().min() {
            Some(&slowest) => shared.buffer.len() - slowest,
            None => 0,
        }
    }

    fn has_room(&self, len: usize) -> bool {
        let cap = match self.cap {
            Some(cap) => cap,
            None => return true,
        };
        let shared = self.shared.lock();
        shared.closed || Self::outstanding(&shared) + len <= cap
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock();
        write!(
            f,
            "Pipe(handle={}, len={}, closed={}, poisoned={}, hint={})",
            self.handle,
            shared.buffer.len(),
            shared.closed,
            shared.poisoned,
            self.debug_hint
        )
    }
}

fn clamp_len(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

/// Writer end of a pipe.
pub struct PipeWriter {
    pipe: Arc<Pipe>,
}

impl PipeWriter {
    /// Append `data` and notify readers.
    ///
    /// Suspends when a soft cap is in force and the slowest reader lags too
    /// far behind; the bytes are written once room opens up, never dropped.
    /// Writing to a closed pipe is an error, not a silent no-op.
    pub async fn write(&self, data: &[u8]) -> Result<usize, PipeError> {
        loop {
            if self.pipe.has_room(data.len()) {
                match self.pipe.write_now(data) {
                    Err(PipeError::CapExceeded) => {} // lost the race, park below
                    other => return other,
                }
            }
            let drain = self.pipe.drain.expect("cap always registers drain");
            let guard = self.pipe.queue.lock();
            if self.pipe.has_room(data.len()) {
                drop(guard);
                continue;
            }
            self.pipe
                .queue
                .wait_guarded(drain, &self.pipe.debug_hint, guard)
                .await?;
        }
    }

    pub fn tell(&self) -> usize {
        self.pipe.len()
    }

    pub fn close(&self) {
        self.pipe.close();
    }

    pub fn is_closed(&self) -> bool {
        self.pipe.is_closed()
    }

    pub fn pipe(&self) -> &Arc<Pipe> {
        &self.pipe
    }
}

/// What a reader should do next, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// Bytes are available at the current position
    ReadNow,
    /// Caught up and the producer failed
    Poisoned,
    /// Caught up and the writer closed cleanly
    Eof,
    /// Caught up, writer still active
    Wait,
}

/// Reader end of a pipe. Each reader owns its position; separate readers are
/// fully independent.
pub struct PipeReader {
    own_handle: Handle,
    pipe: Arc<Pipe>,
    pos: usize,
    closed: bool,
}

impl PipeReader {
    pub fn handle(&self) -> Handle {
        self.own_handle
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Read up to `buf.len()` bytes.
    ///
    /// Returns `Ok(0)` at end-of-stream (writer closed and everything
    /// consumed); suspends while the pipe is empty and open. Data already in
    /// the buffer is always delivered before a poison error.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, PipeError> {
        while !self.closed {
            match self.probe() {
                ReadState::ReadNow => {
                    if buf.is_empty() {
                        return Ok(0);
                    }
                    return Ok(self.take(buf));
                }
                ReadState::Poisoned => return Err(PipeError::Poisoned),
                ReadState::Eof => {
                    self.closed = true;
                    return Ok(0);
                }
                ReadState::Wait => {
                    // Re-check under the queue lock so a write racing with
                    // this check cannot slip between sample and park.
                    let guard = self.pipe.queue.lock();
                    if self.probe() != ReadState::Wait {
                        drop(guard);
                        continue;
                    }
                    self.pipe
                        .queue
                        .wait_guarded(self.pipe.handle, "pipe.reader", guard)
                        .await?;
                }
            }
        }
        Ok(0)
    }

    /// Read the remainder of the stream into a vector.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, PipeError> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.release();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn probe(&self) -> ReadState {
        let shared = self.pipe.shared.lock();
        if self.pos < shared.buffer.len() {
            ReadState::ReadNow
        } else if shared.poisoned {
            ReadState::Poisoned
        } else if shared.closed {
            ReadState::Eof
        } else {
            ReadState::Wait
        }
    }

    fn take(&mut self, buf: &mut [u8]) -> usize {
        let advanced = {
            let shared = self.pipe.shared.lock();
            let available = shared.buffer.len() - self.pos;
            let n = available.min(buf.len());
            buf[..n].copy_from_slice(&shared.buffer[self.pos..self.pos + n]);
            n
        };
        self.pos += advanced;
        if self.pipe.cap.is_some() {
            {
                let mut shared = self.pipe.shared.lock();
                if let Some(entry) = shared.reader_pos.get_mut(&self.own_handle) {
                    *entry = self.pos;
                }
            }
            if let Some(drain) = self.pipe.drain {
                let _ = self.pipe.queue.notify(drain, clamp_len(advanced));
            }
        }
        advanced
    }

    fn release(&mut self) {
        if self.pipe.cap.is_some() {
            self.pipe.shared.lock().reader_pos.remove(&self.own_handle);
            if let Some(drain) = self.pipe.drain {
                // A departing laggard may unblock the writer.
                let _ = self.pipe.queue.notify(drain, 0);
            }
        }
        self.pipe.queue.unregister(self.own_handle);
    }
}

impl fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PipeReader(handle={}, pos={}, closed={}, pipe={:?})",
            self.own_handle, self.pos, self.closed, self.pipe
        )
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue() -> Arc<NotificationQueue> {
        Arc::new(NotificationQueue::new())
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let queue = queue();
        let pipe = Pipe::new(&queue, "basic");
        let writer = pipe.writer();
        let mut reader = pipe.open_reader();

        writer.write(b"hello").await.unwrap();
        writer.close();

        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reads_are_contiguous_and_nonoverlapping() {
        let queue = queue();
        let pipe = Pipe::new(&queue, "contiguous");
        let writer = pipe.writer();
        let mut reader = pipe.open_reader();

        writer.write(b"abcdefgh").await.unwrap();
        writer.close();

        let mut collected = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"abcdefgh");
    }

    #[tokio::test]
    async fn test_late_joiner_sees_full_stream() {
        let queue = queue();
        let pipe = Pipe::new(&queue, "late join");
        let writer = pipe.writer();

        let mut early = pipe.open_reader();
        writer.write(b"first ").await.unwrap();
        let early_bytes_before_close = early.read_to_end();

        writer.write(b"second").await.unwrap();
        writer.close();

        // Attached after the close: must still drain from offset 0.
        let mut late = pipe.open_reader();
        let late_bytes = late.read_to_end().await.unwrap();
        assert_eq!(late_bytes, b"first second");
        assert_eq!(early_bytes_before_close.await.unwrap(), b"first second");
    }

    #[tokio::test]
    async fn test_reader_suspends_until_write() {
        let queue = queue();
        let pipe = Pipe::new(&queue, "suspend");
        let writer = pipe.writer();
        let mut reader = pipe.open_reader();

        let read_task = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            let n = reader.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!read_task.is_finished());

        writer.write(b"wake").await.unwrap();
        assert_eq!(read_task.await.unwrap(), b"wake");
    }

    #[tokio::test]
    async fn test_write_after_close_is_error() {
        let queue = queue();
        let pipe = Pipe::new(&queue, "closed");
        let writer = pipe.writer();
        writer.close();
        assert_eq!(writer.write(b"x").await, Err(PipeError::ClosedPipe));
    }

    #[tokio::test]
    async fn test_zero_byte_write_still_notifies() {
        let queue = queue();
        let pipe = Pipe::new(&queue, "empty write");
        let mut sub = queue.subscribe(pipe.handle(), 4, "observer").unwrap();

        let writer = pipe.writer();
        assert_eq!(writer.write(b"").await.unwrap(), 0);
        assert_eq!(sub.recv().await, Ok(0));
    }

    #[tokio::test]
    async fn test_poison_drains_then_errors() {
        let queue = queue();
        let pipe = Pipe::new(&queue, "poisoned");
        let writer = pipe.writer();
        let mut reader = pipe.open_reader();

        writer.write(b"partial").await.unwrap();
        pipe.poison();

        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 7);
        assert_eq!(&buf[..7], b"partial");
        assert_eq!(reader.read(&mut buf).await, Err(PipeError::Poisoned));
    }

    #[tokio::test]
    async fn test_two_readers_see_identical_bytes() {
        let queue = queue();
        let pipe = Pipe::new(&queue, "broadcast");
        let writer = pipe.writer();
        let mut r1 = pipe.open_reader();
        let mut r2 = pipe.open_reader();

        let producer = tokio::spawn({
            let writer_pipe = Arc::clone(&pipe);
            async move {
                let writer = writer_pipe.writer();
                for chunk in [&b"aa"[..], b"bb", b"cc"] {
                    writer.write(chunk).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                writer.close();
            }
        });
        drop(writer);

        let b1 = r1.read_to_end().await.unwrap();
        let b2 = r2.read_to_end().await.unwrap();
        producer.await.unwrap();
        assert_eq!(b1, b2);
        assert_eq!(b1, b"aabbcc");
    }

    #[tokio::test]
    async fn test_soft_cap_suspends_writer() {
        let queue = queue();
        let pipe = Pipe::with_cap(&queue, "capped", 4);
        let writer = pipe.writer();
        let mut reader = pipe.open_reader();

        writer.write(b"abcd").await.unwrap();

        let write_task = tokio::spawn({
            let pipe = Arc::clone(&pipe);
            async move { pipe.writer().write(b"efgh").await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!write_task.is_finished(), "writer should be parked on cap");
        assert_eq!(pipe.len(), 4, "capped writer must not discard");

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);

        write_task.await.unwrap().unwrap();
        assert_eq!(pipe.len(), 8);
        pipe.close();
    }

    #[tokio::test]
    async fn test_write_now_respects_cap() {
        let queue = queue();
        let pipe = Pipe::with_cap(&queue, "sync cap", 2);
        let _reader = pipe.open_reader();
        assert_eq!(pipe.write_now(b"ab"), Ok(2));
        assert_eq!(pipe.write_now(b"c"), Err(PipeError::CapExceeded));
    }

    #[tokio::test]
    async fn test_reader_after_teardown_sees_eof() {
        let queue = queue();
        let pipe = Pipe::new(&queue, "teardown");
        let mut reader = pipe.open_reader();
        pipe.close();

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }
}
