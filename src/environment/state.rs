// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! SQLite persistence for snapshots.
//!
//! The on-disk layout is a single table `Dict` with two BLOB columns
//! `key, value`. Keys are node names (or alias names, which start with a
//! dot); values are the bytes the node's output pipe observed.
//!
//! The connection is mutex-wrapped: `rusqlite::Connection` is `Send` but
//! not `Sync`, so shared access needs explicit serialization.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state database: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("state key is not valid utf-8")]
    BadKey,
}

/// A `Dict(key, value)` table behind a file path (or `:memory:`).
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateError> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS Dict (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn save(&self, items: &[(String, Vec<u8>)]) -> Result<(), StateError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for (key, value) in items {
            tx.execute(
                "INSERT OR REPLACE INTO Dict (key, value) VALUES (?, ?)",
                params![key.as_bytes(), value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<(String, Vec<u8>)>, StateError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key, value FROM Dict ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut items = Vec::new();
        for row in rows {
            let (key, value) = row?;
            let key = String::from_utf8(key).map_err(|_| StateError::BadKey)?;
            items.push((key, value));
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        let store = StateStore::open(&path).unwrap();
        let items = vec![
            ("value.1".to_string(), b"Hello!".to_vec()),
            (".end".to_string(), br#"["value.1"]"#.to_vec()),
        ];
        store.save(&items).unwrap();
        drop(store);

        let reopened = StateStore::open(&path).unwrap();
        assert_eq!(reopened.load().unwrap(), items);
    }

    #[test]
    fn test_save_overwrites_existing_keys() {
        let store = StateStore::open(":memory:").unwrap();
        store
            .save(&[("k".to_string(), b"old".to_vec())])
            .unwrap();
        store
            .save(&[("k".to_string(), b"new".to_vec())])
            .unwrap();
        assert_eq!(store.load().unwrap(), vec![("k".to_string(), b"new".to_vec())]);
    }
}
