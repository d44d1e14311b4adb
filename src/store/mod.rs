//! Generic path-addressed property store backed by SQLite.
//!
//! Every entity at every level is a row in `entities` plus a row-set of
//! `(name, typed value)` tuples in `props`, keyed by a surrogate id. Names
//! starting with `#` are private bookkeeping: persisted like any other
//! property, never serialized to API consumers.
//!
//! All access happens inside a transaction obtained through
//! [`Store::with_read`] / [`Store::with_write`]; a write transaction spans
//! the caller's whole descent-and-mutate sequence and commits atomically,
//! so an error anywhere rolls the entire request back.
#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, trace};

use crate::error::{RegistryError, Result};
use crate::path::EntityKind;
use crate::value::PropValue;

/// One scanned property row.
#[derive(Clone, Debug)]
pub struct PropRow {
    /// Entity path the property belongs to.
    pub path: String,
    /// Flattened property name (may be `#`-prefixed).
    pub name: String,
    /// Typed value.
    pub value: PropValue,
}

/// SQLite-backed property store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) a store at `path`.
    pub fn open(path: &Path) -> Result<Store> {
        let conn = Connection::open(path)?;
        Self::bootstrap(&conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (tests, ephemeral registries).
    pub fn open_in_memory() -> Result<Store> {
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(&conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    fn bootstrap(conn: &Connection) -> Result<()> {
        conn.busy_timeout(Duration::from_millis(5_000))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entities (
                e_sid TEXT PRIMARY KEY,
                path  TEXT NOT NULL UNIQUE,
                kind  INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS props (
                e_sid TEXT NOT NULL,
                name  TEXT NOT NULL,
                kind  TEXT NOT NULL,
                json  TEXT NOT NULL,
                PRIMARY KEY (e_sid, name)
            );
            CREATE INDEX IF NOT EXISTS idx_entities_kind ON entities (kind, path);",
        )?;
        debug!("property store ready");
        Ok(())
    }

    /// Run `f` inside a read transaction (consistent multi-entity snapshot).
    pub fn with_read<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let inner = conn.transaction()?;
        let tx = Tx {
            inner,
            write: false,
        };
        let out = f(&tx)?;
        tx.inner.commit()?;
        Ok(out)
    }

    /// Run `f` inside an IMMEDIATE write transaction.
    ///
    /// The write lock is taken up front, so entities loaded inside `f` are
    /// never stale. On error the transaction rolls back on drop.
    pub fn with_write<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let inner = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let tx = Tx { inner, write: true };
        match f(&tx) {
            Ok(out) => {
                tx.inner.commit()?;
                Ok(out)
            }
            Err(err) => {
                trace!(error = %err, "write transaction rolled back");
                Err(err)
            }
        }
    }
}

/// An open store transaction.
pub struct Tx<'conn> {
    inner: rusqlite::Transaction<'conn>,
    write: bool,
}

impl Tx<'_> {
    /// Whether this transaction may mutate.
    pub fn is_write(&self) -> bool {
        self.write
    }

    fn require_write(&self) -> Result<()> {
        if self.write {
            Ok(())
        } else {
            Err(RegistryError::Storage(
                "mutation attempted inside a read transaction".to_string(),
            ))
        }
    }

    /// Surrogate id for `path`, if the entity exists.
    pub fn entity_sid(&self, path: &str) -> Result<Option<String>> {
        let mut stmt = self
            .inner
            .prepare_cached("SELECT e_sid FROM entities WHERE path = ?1")?;
        Ok(stmt
            .query_row(params![path], |row| row.get::<_, String>(0))
            .optional()?)
    }

    /// Does an entity exist at `path`?
    pub fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.entity_sid(path)?.is_some())
    }

    /// Register an entity at `path`, returning its surrogate id.
    ///
    /// Idempotent: an existing entity keeps its sid (and its kind must
    /// match).
    pub fn register(&self, path: &str, kind: EntityKind) -> Result<String> {
        self.require_write()?;
        if let Some(sid) = self.entity_sid(path)? {
            return Ok(sid);
        }
        let sid = new_sid();
        let mut stmt = self
            .inner
            .prepare_cached("INSERT INTO entities (e_sid, path, kind) VALUES (?1, ?2, ?3)")?;
        stmt.execute(params![sid, path, kind.as_i64()])?;
        trace!(path, sid, "entity registered");
        Ok(sid)
    }

    /// Delete the entity at `path` and its whole subtree, properties
    /// included.
    pub fn remove_tree(&self, path: &str) -> Result<()> {
        self.require_write()?;
        self.inner.execute(
            "DELETE FROM props WHERE e_sid IN
               (SELECT e_sid FROM entities
                WHERE path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/')",
            params![path],
        )?;
        let removed = self.inner.execute(
            "DELETE FROM entities
             WHERE path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/'",
            params![path],
        )?;
        trace!(path, removed, "entity subtree removed");
        Ok(())
    }

    /// Read one property.
    pub fn get(&self, path: &str, name: &str) -> Result<Option<PropValue>> {
        let mut stmt = self.inner.prepare_cached(
            "SELECT p.kind, p.json FROM props p
             JOIN entities e ON e.e_sid = p.e_sid
             WHERE e.path = ?1 AND p.name = ?2",
        )?;
        let row = stmt
            .query_row(params![path, name], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .optional()?;
        match row {
            Some((kind, json)) => Ok(Some(PropValue::from_storage(&kind, &json)?)),
            None => Ok(None),
        }
    }

    /// Upsert one property. The entity must already be registered.
    pub fn set(&self, path: &str, name: &str, value: &PropValue) -> Result<()> {
        self.require_write()?;
        let sid = self
            .entity_sid(path)?
            .ok_or_else(|| RegistryError::Storage(format!("no entity at '{path}'")))?;
        let mut stmt = self.inner.prepare_cached(
            "INSERT INTO props (e_sid, name, kind, json) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (e_sid, name) DO UPDATE SET kind = ?3, json = ?4",
        )?;
        stmt.execute(params![sid, name, value.kind(), value.storage_json()])?;
        Ok(())
    }

    /// Delete one property, if present.
    pub fn delete_prop(&self, path: &str, name: &str) -> Result<()> {
        self.require_write()?;
        self.inner.execute(
            "DELETE FROM props WHERE name = ?2 AND e_sid IN
               (SELECT e_sid FROM entities WHERE path = ?1)",
            params![path, name],
        )?;
        Ok(())
    }

    /// Delete every property row at or under the flattened attribute path
    /// `flat` (used when replacing a nested attribute wholesale).
    pub fn delete_props_under(&self, path: &str, flat: &str) -> Result<()> {
        self.require_write()?;
        self.inner.execute(
            "DELETE FROM props WHERE e_sid IN
               (SELECT e_sid FROM entities WHERE path = ?1)
             AND (name = ?2
                  OR substr(name, 1, length(?2) + 1) = ?2 || '.'
                  OR substr(name, 1, length(?2) + 1) = ?2 || '[')",
            params![path, flat],
        )?;
        Ok(())
    }

    /// All properties of one entity, ordered by name.
    pub fn load_props(&self, path: &str) -> Result<BTreeMap<String, PropValue>> {
        let mut stmt = self.inner.prepare_cached(
            "SELECT p.name, p.kind, p.json FROM props p
             JOIN entities e ON e.e_sid = p.e_sid
             WHERE e.path = ?1 ORDER BY p.name",
        )?;
        let mut props = BTreeMap::new();
        let rows = stmt.query_map(params![path], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (name, kind, json) = row?;
            props.insert(name.clone(), PropValue::from_storage(&kind, &json)?);
        }
        Ok(props)
    }

    /// Ordered scan of every property at or under `path_prefix`.
    pub fn scan(&self, path_prefix: &str) -> Result<Vec<PropRow>> {
        let mut stmt = self.inner.prepare_cached(
            "SELECT e.path, p.name, p.kind, p.json FROM props p
             JOIN entities e ON e.e_sid = p.e_sid
             WHERE e.path = ?1 OR substr(e.path, 1, length(?1) + 1) = ?1 || '/'
             ORDER BY e.path, p.name",
        )?;
        let mut out = Vec::new();
        let rows = stmt.query_map(params![path_prefix], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        for row in rows {
            let (path, name, kind, json) = row?;
            out.push(PropRow {
                path,
                name: name.clone(),
                value: PropValue::from_storage(&kind, &json)?,
            });
        }
        Ok(out)
    }

    /// Paths of entities of `kind` directly under `collection_prefix`
    /// (a path ending in `/`), ordered by path.
    pub fn children(&self, collection_prefix: &str, kind: EntityKind) -> Result<Vec<String>> {
        let mut stmt = self.inner.prepare_cached(
            "SELECT path FROM entities
             WHERE kind = ?1 AND substr(path, 1, length(?2)) = ?2
             ORDER BY path",
        )?;
        let rows = stmt.query_map(params![kind.as_i64(), collection_prefix], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn new_sid() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}
