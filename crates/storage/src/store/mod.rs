#![forbid(unsafe_code)]

mod deps;
mod error;
mod jobs;
mod migrate;
mod sequences;
mod types;

pub use error::StoreError;
pub use types::*;

use crate::lock::{FileLock, LockGuard};
use rusqlite::{Connection, OptionalExtension, Transaction};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_FILE: &str = "jobs_v2.sqlite";
pub const LEGACY_DB_FILE: &str = "jobs.sqlite";
pub const LOCK_FILE: &str = "jobs.lock";

/// Bound on the `_recentItems_` style history list kept in the meta table.
const NUM_RECENT: usize = 100;

const META_SCHEMA_VERSION: &str = "schema_version";
const META_UIDX: &str = "uidx";
const META_LAST_JOB: &str = "last_job";
const META_RECENT: &str = "recent";

/// Durable job store backed by a single SQLite database under `root`.
///
/// Reads go through `&self`; anything that mutates rows must first take the
/// cross-process lock via [`SqliteStore::exclusive`], which yields a
/// [`StoreWriter`] holding the lock for the duration of the mutation.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    root: PathBuf,
    lock: FileLock,
}

/// Write handle: the store plus the held cross-process lock. Mutating
/// operations live here so they cannot run unlocked. The lock is released
/// when the writer drops.
#[derive(Debug)]
pub struct StoreWriter<'a> {
    store: &'a mut SqliteStore,
    _guard: LockGuard,
}

impl std::ops::Deref for StoreWriter<'_> {
    type Target = SqliteStore;

    fn deref(&self) -> &SqliteStore {
        self.store
    }
}

impl SqliteStore {
    /// Opens (creating or migrating as needed) the store under `root`.
    ///
    /// The cross-process lock is held for the duration of the open so two
    /// processes cannot race the migration; it is released before this
    /// returns. A fresh database that fails mid-install is removed again so
    /// the next open starts clean.
    pub fn open(root: impl AsRef<Path>, lock_timeout: Duration) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let lock = FileLock::new(root.join(LOCK_FILE));
        let guard = lock.acquire(lock_timeout)?;

        let db_path = root.join(DB_FILE);
        let fresh = !db_path.exists();
        let legacy_path = root.join(LEGACY_DB_FILE);

        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;

        let legacy = if fresh && legacy_path.exists() {
            Some(legacy_path.as_path())
        } else {
            None
        };
        if let Err(err) = migrate::prepare(&conn, fresh, legacy) {
            drop(conn);
            if fresh {
                remove_db_files(&db_path);
            }
            drop(guard);
            return Err(err);
        }

        drop(guard);
        Ok(Self { conn, root, lock })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Takes the cross-process lock, blocking up to `timeout`, and returns
    /// the write handle.
    pub fn exclusive(&mut self, timeout: Duration) -> Result<StoreWriter<'_>, StoreError> {
        let guard = self.lock.acquire(timeout)?;
        Ok(StoreWriter {
            store: self,
            _guard: guard,
        })
    }

    /// Key of the most recent non-auto job, if any.
    pub fn last_job(&self) -> Result<Option<String>, StoreError> {
        let value = meta_get(&self.conn, META_LAST_JOB)?;
        Ok(value.filter(|v| !v.is_empty()))
    }

    /// Recently finished job keys, newest first, capped at the history bound.
    pub fn recent_keys(&self) -> Result<Vec<String>, StoreError> {
        let raw = meta_get(&self.conn, META_RECENT)?.unwrap_or_else(|| "[]".to_string());
        decode_string_list(&raw)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

impl StoreWriter<'_> {
    pub(crate) fn transaction(&mut self) -> Result<Transaction<'_>, StoreError> {
        Ok(self.store.conn.transaction()?)
    }
}

fn remove_db_files(db_path: &Path) {
    let _ = std::fs::remove_file(db_path);
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = db_path.as_os_str().to_owned();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(sidecar));
    }
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn meta_get(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    let value = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            rusqlite::params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

pub(crate) fn meta_set_tx(tx: &Transaction<'_>, key: &str, value: &str) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![key, value],
    )?;
    Ok(())
}

pub(crate) fn meta_get_tx(tx: &Transaction<'_>, key: &str) -> Result<Option<String>, StoreError> {
    let value = tx
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            rusqlite::params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

/// Allocates the next unique job index from the meta counter.
pub(crate) fn next_uidx_tx(tx: &Transaction<'_>) -> Result<u64, StoreError> {
    let current: u64 = meta_get_tx(tx, META_UIDX)?
        .as_deref()
        .unwrap_or("0")
        .parse()
        .map_err(|_| StoreError::invalid("meta uidx counter is not a number"))?;
    let next = current + 1;
    meta_set_tx(tx, META_UIDX, &next.to_string())?;
    Ok(next)
}

pub(crate) fn set_last_job_tx(tx: &Transaction<'_>, key: &str) -> Result<(), StoreError> {
    meta_set_tx(tx, META_LAST_JOB, key)
}

/// Prepends `key` to the recent-keys list, dropping duplicates and trimming
/// to the history bound.
pub(crate) fn push_recent_tx(tx: &Transaction<'_>, key: &str) -> Result<(), StoreError> {
    let raw = meta_get_tx(tx, META_RECENT)?.unwrap_or_else(|| "[]".to_string());
    let mut recent = decode_string_list(&raw)?;
    recent.retain(|existing| existing != key);
    recent.insert(0, key.to_string());
    recent.truncate(NUM_RECENT);
    meta_set_tx(tx, META_RECENT, &encode_string_list(&recent))
}

pub(crate) fn encode_string_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn decode_string_list(raw: &str) -> Result<Vec<String>, StoreError> {
    serde_json::from_str(raw)
        .map_err(|err| StoreError::invalid(format!("stored string list is not valid JSON: {err}")))
}

pub(crate) fn encode_env(env: &[(String, String)]) -> String {
    let map: serde_json::Map<String, serde_json::Value> = env
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect();
    serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
}

pub(crate) fn decode_env(raw: &str) -> Result<Vec<(String, String)>, StoreError> {
    let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(raw)
        .map_err(|err| StoreError::invalid(format!("stored env is not valid JSON: {err}")))?;
    let mut env = Vec::with_capacity(map.len());
    for (name, value) in map {
        match value {
            serde_json::Value::String(v) => env.push((name, v)),
            other => {
                return Err(StoreError::invalid(format!(
                    "stored env value for {name} is not a string: {other}"
                )));
            }
        }
    }
    Ok(env)
}
