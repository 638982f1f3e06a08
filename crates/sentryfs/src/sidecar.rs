//! The sidecar store.
//!
//! A single SQLite database file, `.metadata.db`, living in the backing
//! directory, holds everything the backing filesystem itself cannot:
//! user extended attributes, whole-file checksums, and (in block mode)
//! per-block checksums. All `path` values are virtual paths starting
//! with `/`, never backing paths.
//!
//! The connection is guarded by a mutex; statements are prepared per call
//! and each call is a single serialized unit with respect to other threads.
//! The one exception is [`Sidecar::rename_path`], which relabels the rows
//! of all three tables inside one transaction so that observers never see
//! a half-renamed sidecar.

use std::{
    path::Path,
    sync::Mutex,
};

use rusqlite::{named_params, params, Connection, OptionalExtension};

use crate::error::Result;

/// Name of the sidecar database file inside the backing directory.
pub const SIDECAR_FILE: &str = ".metadata.db";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metadata (
    path  TEXT NOT NULL,
    key   TEXT NOT NULL,
    value BLOB,
    PRIMARY KEY (path, key)
);
CREATE TABLE IF NOT EXISTS checksums (
    path     TEXT PRIMARY KEY,
    checksum TEXT
);
CREATE TABLE IF NOT EXISTS block_hashes (
    path        TEXT NOT NULL,
    block_index INTEGER NOT NULL,
    checksum    TEXT,
    PRIMARY KEY (path, block_index)
);
";

/// Handle to the sidecar database.
#[derive(Debug)]
pub struct Sidecar {
    conn: Mutex<Connection>,
}

impl Sidecar {
    /// Open (creating if necessary) the sidecar in the given backing
    /// directory and make sure the schema exists.
    pub fn open_in(backing_root: &Path) -> Result<Self> {
        let conn = Connection::open(backing_root.join(SIDECAR_FILE))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // a poisoned sidecar lock means a statement panicked mid-call;
        // the connection itself is still usable
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ========== Extended attributes ==========

    /// Upsert one attribute of `path`.
    pub fn put_xattr(&self, path: &str, key: &str, value: &[u8]) -> Result<()> {
        self.lock().execute(
            "INSERT INTO metadata (path, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (path, key) DO UPDATE SET value = excluded.value",
            params![path, key, value],
        )?;
        Ok(())
    }

    /// Look up one attribute of `path`.
    pub fn get_xattr(&self, path: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .lock()
            .query_row(
                "SELECT value FROM metadata WHERE path = ?1 AND key = ?2",
                params![path, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// All attribute names of `path`. Order is unspecified.
    pub fn list_xattrs(&self, path: &str) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT key FROM metadata WHERE path = ?1")?;
        let keys = stmt
            .query_map(params![path], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }

    /// Delete one attribute of `path`; reports whether a row existed.
    pub fn del_xattr(&self, path: &str, key: &str) -> Result<bool> {
        let n = self.lock().execute(
            "DELETE FROM metadata WHERE path = ?1 AND key = ?2",
            params![path, key],
        )?;
        Ok(n > 0)
    }

    /// Delete every attribute of `path`.
    pub fn del_xattrs(&self, path: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM metadata WHERE path = ?1", params![path])?;
        Ok(())
    }

    // ========== Whole-file checksums ==========

    /// Upsert the file-level digest of `path`.
    pub fn put_digest(&self, path: &str, digest: &str) -> Result<()> {
        self.lock().execute(
            "INSERT INTO checksums (path, checksum) VALUES (?1, ?2)
             ON CONFLICT (path) DO UPDATE SET checksum = excluded.checksum",
            params![path, digest],
        )?;
        Ok(())
    }

    /// The stored file-level digest of `path`, if any.
    pub fn get_digest(&self, path: &str) -> Result<Option<String>> {
        let digest = self
            .lock()
            .query_row(
                "SELECT checksum FROM checksums WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(digest)
    }

    /// Drop the file-level digest row of `path`.
    pub fn del_digest(&self, path: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM checksums WHERE path = ?1", params![path])?;
        Ok(())
    }

    // ========== Per-block checksums ==========

    /// Upsert the digest of one block of `path`.
    pub fn put_block(&self, path: &str, index: u64, digest: &str) -> Result<()> {
        self.lock().execute(
            "INSERT INTO block_hashes (path, block_index, checksum) VALUES (?1, ?2, ?3)
             ON CONFLICT (path, block_index) DO UPDATE SET checksum = excluded.checksum",
            params![path, index as i64, digest],
        )?;
        Ok(())
    }

    /// The stored digest of one block of `path`, if any.
    pub fn get_block(&self, path: &str, index: u64) -> Result<Option<String>> {
        let digest = self
            .lock()
            .query_row(
                "SELECT checksum FROM block_hashes WHERE path = ?1 AND block_index = ?2",
                params![path, index as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(digest)
    }

    /// Delete the block rows of `path` strictly beyond `last_kept`.
    pub fn del_blocks_after(&self, path: &str, last_kept: u64) -> Result<()> {
        self.lock().execute(
            "DELETE FROM block_hashes WHERE path = ?1 AND block_index > ?2",
            params![path, last_kept as i64],
        )?;
        Ok(())
    }

    /// Delete every block row of `path`.
    pub fn del_blocks(&self, path: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM block_hashes WHERE path = ?1", params![path])?;
        Ok(())
    }

    // ========== Path lifecycle ==========

    /// Drop every sidecar row of `path`: attributes, file digest, block
    /// digests. Used on unlink.
    pub fn forget_path(&self, path: &str) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM metadata WHERE path = ?1", params![path])?;
        tx.execute("DELETE FROM checksums WHERE path = ?1", params![path])?;
        tx.execute("DELETE FROM block_hashes WHERE path = ?1", params![path])?;
        tx.commit()?;
        Ok(())
    }

    /// Relabel all rows of `old` (and, for a renamed directory, everything
    /// below `old/`) to refer to `new`, in one transaction.
    ///
    /// Rows already present at `new` belong to a file the backing rename
    /// overwrote; they are dropped first, or the relabel would collide with
    /// the primary key and leave `new` bound to the stale rows.
    pub fn rename_path(&self, old: &str, new: &str) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for table in ["metadata", "checksums", "block_hashes"] {
            tx.execute(
                &format!(
                    "DELETE FROM {table}
                     WHERE path = :new OR substr(path, 1, length(:new) + 1) = :new || '/'"
                ),
                named_params! { ":new": new },
            )?;
            tx.execute(
                &format!(
                    "UPDATE {table} SET path = :new || substr(path, length(:old) + 1)
                     WHERE path = :old OR substr(path, 1, length(:old) + 1) = :old || '/'"
                ),
                named_params! { ":old": old, ":new": new },
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}
