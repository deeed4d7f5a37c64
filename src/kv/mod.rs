//! Key-stream store: the virtual filesystem actors see.
//!
//! A flat map from UTF-8 keys to pipes. A stored *value* is simply a pipe
//! that was closed over its contents, so readers cannot tell literals from
//! streams. There is no directory structure; prefixes like `out/` are
//! conventions enforced by actors, not by the store.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::errors::KvError;
use crate::notify::NotificationQueue;
use crate::pipe::{Pipe, PipeReader, PipeWriter};

/// Registry mapping string keys to pipes.
pub struct KeyStore {
    queue: Arc<NotificationQueue>,
    entries: Mutex<HashMap<String, Arc<Pipe>>>,
}

impl KeyStore {
    pub fn new(queue: Arc<NotificationQueue>) -> Self {
        Self {
            queue,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Bind an existing pipe to `key`.
    pub fn put_pipe(&self, key: &str, pipe: Arc<Pipe>) -> Result<(), KvError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Err(KvError::Exists(key.to_string()));
        }
        debug!(key, "pipe registered");
        entries.insert(key.to_string(), pipe);
        Ok(())
    }

    /// Store a literal: a pipe already closed over `bytes`.
    pub fn put_value(&self, key: &str, bytes: &[u8]) -> Result<Arc<Pipe>, KvError> {
        let pipe = Pipe::new(&self.queue, key);
        pipe.write_now(bytes).expect("fresh unbounded pipe accepts writes");
        pipe.close();
        self.put_pipe(key, Arc::clone(&pipe))?;
        Ok(pipe)
    }

    /// Create a fresh open pipe under `key`.
    pub fn create_pipe(&self, key: &str) -> Result<Arc<Pipe>, KvError> {
        let pipe = Pipe::new(&self.queue, key);
        self.put_pipe(key, Arc::clone(&pipe))?;
        Ok(pipe)
    }

    /// Create a fresh open pipe under `key` and return its writer.
    pub fn open_write(&self, key: &str) -> Result<PipeWriter, KvError> {
        Ok(self.create_pipe(key)?.writer())
    }

    /// Open a reader on the pipe under `key`, positioned at offset 0.
    pub fn open_read(&self, key: &str) -> Result<PipeReader, KvError> {
        let entries = self.entries.lock();
        match entries.get(key) {
            Some(pipe) => Ok(pipe.open_reader()),
            None => Err(KvError::NotFound(key.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Pipe>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn delete(&self, key: &str) -> Result<(), KvError> {
        match self.entries.lock().remove(key) {
            Some(_) => Ok(()),
            None => Err(KvError::NotFound(key.to_string())),
        }
    }

    /// All keys, sorted for deterministic iteration.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Close every pipe in the store. Suspended readers resume with
    /// end-of-stream, writers with an error.
    pub fn close_all(&self) {
        let pipes: Vec<Arc<Pipe>> = self.entries.lock().values().cloned().collect();
        for pipe in pipes {
            if !pipe.is_closed() {
                pipe.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> KeyStore {
        KeyStore::new(Arc::new(NotificationQueue::new()))
    }

    #[tokio::test]
    async fn test_put_value_reads_back_then_eof() {
        let store = store();
        store.put_value("greeting", b"Hello!").unwrap();

        let mut reader = store.open_read("greeting").unwrap();
        assert_eq!(reader.read_to_end().await.unwrap(), b"Hello!");

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let store = store();
        store.put_value("k", b"a").unwrap();
        assert_eq!(
            store.put_value("k", b"b").unwrap_err(),
            KvError::Exists("k".to_string())
        );
    }

    #[tokio::test]
    async fn test_open_read_missing_key() {
        let store = store();
        assert_eq!(
            store.open_read("nope").unwrap_err(),
            KvError::NotFound("nope".to_string())
        );
    }

    #[tokio::test]
    async fn test_open_write_then_stream() {
        let store = store();
        let writer = store.open_write("stream").unwrap();
        let mut reader = store.open_read("stream").unwrap();

        writer.write(b"live data").await.unwrap();
        writer.close();
        assert_eq!(reader.read_to_end().await.unwrap(), b"live data");
    }

    #[tokio::test]
    async fn test_delete_and_exists() {
        let store = store();
        store.put_value("temp", b"x").unwrap();
        assert!(store.exists("temp"));
        store.delete("temp").unwrap();
        assert!(!store.exists("temp"));
        assert!(store.delete("temp").is_err());
    }

    #[tokio::test]
    async fn test_keys_sorted() {
        let store = store();
        store.put_value("b", b"2").unwrap();
        store.put_value("a", b"1").unwrap();
        assert_eq!(store.keys(), vec!["a".to_string(), "b".to_string()]);
    }
}
