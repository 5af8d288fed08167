//! Per-member persisted sync state: anchors and last-seen content hashes.
//!
//! One SQLite file per member config directory, loaded at connect time and
//! written back at sync-done time.

use crate::error::{GroupError, GroupResult};
use opensync_types::ObjType;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

const STORE_FILE: &str = "sync-state.db";

/// SQLite-backed anchor and hash store for one member.
pub struct MemberStore {
    conn: Arc<Mutex<Connection>>,
}

impl MemberStore {
    /// Opens (or creates) the store under a member's config directory.
    pub fn open(member_dir: &Path) -> GroupResult<Self> {
        std::fs::create_dir_all(member_dir)?;
        let conn = Connection::open(member_dir.join(STORE_FILE))
            .map_err(|e| GroupError::Storage(format!("failed to open member store: {e}")))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> GroupResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| GroupError::Storage(format!("failed to open in-memory store: {e}")))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> GroupResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS anchors (
                objtype TEXT PRIMARY KEY,
                anchor TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS hashes (
                objtype TEXT NOT NULL,
                uid TEXT NOT NULL,
                hash TEXT NOT NULL,
                UNIQUE(objtype, uid)
            );
            ",
        )
        .map_err(|e| GroupError::Storage(format!("failed to init member store schema: {e}")))?;
        Ok(())
    }

    // ── Anchors ──────────────────────────────────────────────────

    /// Returns the stored anchor for an object type.
    pub fn anchor(&self, objtype: &ObjType) -> GroupResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT anchor FROM anchors WHERE objtype = ?1")
            .map_err(|e| GroupError::Storage(e.to_string()))?;
        let mut rows = stmt
            .query(params![objtype.as_str()])
            .map_err(|e| GroupError::Storage(e.to_string()))?;
        match rows.next().map_err(|e| GroupError::Storage(e.to_string()))? {
            Some(row) => Ok(Some(
                row.get::<_, String>(0)
                    .map_err(|e| GroupError::Storage(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    /// Stores the anchor for an object type.
    pub fn set_anchor(&self, objtype: &ObjType, anchor: &str) -> GroupResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO anchors (objtype, anchor) VALUES (?1, ?2)
             ON CONFLICT(objtype) DO UPDATE SET anchor = excluded.anchor",
            params![objtype.as_str(), anchor],
        )
        .map_err(|e| GroupError::Storage(e.to_string()))?;
        Ok(())
    }

    /// True when a stored anchor exists and differs from the current one,
    /// which forces a slow sync for that object type.
    pub fn anchor_mismatch(&self, objtype: &ObjType, current: &str) -> GroupResult<bool> {
        Ok(matches!(self.anchor(objtype)?, Some(stored) if stored != current))
    }

    // ── Hashes ───────────────────────────────────────────────────

    /// Loads the last-seen uid → hash table for an object type.
    pub fn load_hashes(&self, objtype: &ObjType) -> GroupResult<HashMap<String, String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT uid, hash FROM hashes WHERE objtype = ?1")
            .map_err(|e| GroupError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(params![objtype.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| GroupError::Storage(e.to_string()))?;

        let mut map = HashMap::new();
        for row in rows {
            let (uid, hash) = row.map_err(|e| GroupError::Storage(e.to_string()))?;
            map.insert(uid, hash);
        }
        Ok(map)
    }

    /// Writes a batch of hash updates; `None` removes the uid's row.
    pub fn update_hashes(
        &self,
        objtype: &ObjType,
        updates: &[(String, Option<String>)],
    ) -> GroupResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| GroupError::Storage(e.to_string()))?;
        for (uid, hash) in updates {
            match hash {
                Some(hash) => {
                    tx.execute(
                        "INSERT INTO hashes (objtype, uid, hash) VALUES (?1, ?2, ?3)
                         ON CONFLICT(objtype, uid) DO UPDATE SET hash = excluded.hash",
                        params![objtype.as_str(), uid, hash],
                    )
                    .map_err(|e| GroupError::Storage(e.to_string()))?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM hashes WHERE objtype = ?1 AND uid = ?2",
                        params![objtype.as_str(), uid],
                    )
                    .map_err(|e| GroupError::Storage(e.to_string()))?;
                }
            }
        }
        tx.commit().map_err(|e| GroupError::Storage(e.to_string()))?;
        Ok(())
    }
}
