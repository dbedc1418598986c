#![forbid(unsafe_code)]

use super::{
    META_LAST_JOB, META_RECENT, META_SCHEMA_VERSION, META_UIDX, StoreError, encode_env,
    encode_string_list, meta_get, meta_set_tx,
};
use jt_core::model::{DepEdge, DepPredicate};
use rusqlite::{Connection, OpenFlags, Transaction, params};
use std::path::Path;
use time::{Date, Month, PrimitiveDateTime, Time};

pub(crate) const SCHEMA_VERSION: i64 = 2;

const CREATE_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
  key TEXT PRIMARY KEY,
  uidx INTEGER NOT NULL,
  state TEXT NOT NULL CHECK(state IN ('active', 'inactive')),
  cmd_json TEXT NOT NULL,
  reminder TEXT,
  pwd TEXT NOT NULL,
  workspace TEXT,
  project TEXT,
  host TEXT NOT NULL,
  user TEXT NOT NULL,
  env_json TEXT NOT NULL,
  create_time_ms INTEGER NOT NULL,
  start_time_ms INTEGER,
  stop_time_ms INTEGER,
  pid INTEGER,
  rc INTEGER,
  logfile TEXT,
  isolate INTEGER NOT NULL DEFAULT 0,
  auto_job INTEGER NOT NULL DEFAULT 0,
  mail_job INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
CREATE INDEX IF NOT EXISTS idx_jobs_workspace ON jobs(workspace);
CREATE INDEX IF NOT EXISTS idx_jobs_create ON jobs(create_time_ms);
CREATE INDEX IF NOT EXISTS idx_jobs_state_create ON jobs(state, create_time_ms);

CREATE TABLE IF NOT EXISTS job_deps (
  job_key TEXT NOT NULL,
  depends_on_key TEXT NOT NULL,
  predicate TEXT NOT NULL DEFAULT 'any_exit',
  ord INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY(job_key, depends_on_key)
);

CREATE INDEX IF NOT EXISTS idx_job_deps_job ON job_deps(job_key, ord);

CREATE TABLE IF NOT EXISTS sequences (
  name TEXT PRIMARY KEY,
  root_key TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sequence_steps (
  seq_name TEXT NOT NULL,
  step INTEGER NOT NULL,
  source_key TEXT NOT NULL,
  cmd_json TEXT NOT NULL,
  reminder TEXT,
  pwd TEXT NOT NULL,
  workspace TEXT,
  project TEXT,
  host TEXT NOT NULL,
  user TEXT NOT NULL,
  env_json TEXT NOT NULL,
  isolate INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY(seq_name, step)
);

CREATE TABLE IF NOT EXISTS sequence_edges (
  seq_name TEXT NOT NULL,
  step INTEGER NOT NULL,
  depends_on_step INTEGER NOT NULL,
  predicate TEXT NOT NULL,
  PRIMARY KEY(seq_name, step, depends_on_step)
);
"#;

const V1_TO_V2_SQL: &str = r#"
ALTER TABLE job_deps ADD COLUMN predicate TEXT NOT NULL DEFAULT 'any_exit';
ALTER TABLE job_deps ADD COLUMN ord INTEGER NOT NULL DEFAULT 0;

CREATE TABLE IF NOT EXISTS sequences (
  name TEXT PRIMARY KEY,
  root_key TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sequence_steps (
  seq_name TEXT NOT NULL,
  step INTEGER NOT NULL,
  source_key TEXT NOT NULL,
  cmd_json TEXT NOT NULL,
  reminder TEXT,
  pwd TEXT NOT NULL,
  workspace TEXT,
  project TEXT,
  host TEXT NOT NULL,
  user TEXT NOT NULL,
  env_json TEXT NOT NULL,
  isolate INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY(seq_name, step)
);

CREATE TABLE IF NOT EXISTS sequence_edges (
  seq_name TEXT NOT NULL,
  step INTEGER NOT NULL,
  depends_on_step INTEGER NOT NULL,
  predicate TEXT NOT NULL,
  PRIMARY KEY(seq_name, step, depends_on_step)
);
"#;

/// Brings the database to the current schema. `fresh` means the file did
/// not exist before this open; a fresh install (plus the optional one-time
/// import of a legacy key-value database) happens in a single transaction
/// with the version marker written last, so a crash leaves either a
/// complete store or one the caller deletes and recreates.
pub(crate) fn prepare(
    conn: &Connection,
    fresh: bool,
    legacy: Option<&Path>,
) -> Result<(), StoreError> {
    if fresh {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(CREATE_TABLES_SQL)?;
        init_meta_tx(&tx)?;
        if let Some(path) = legacy {
            import_legacy_tx(&tx, path)?;
        }
        meta_set_tx(&tx, META_SCHEMA_VERSION, &SCHEMA_VERSION.to_string())?;
        tx.commit()?;
        return Ok(());
    }

    let version = read_version(conn)?;
    if version == SCHEMA_VERSION {
        return Ok(());
    }
    if version > SCHEMA_VERSION {
        return Err(StoreError::MigrationFailed {
            message: format!(
                "store has schema version {version}, this build supports up to {SCHEMA_VERSION}"
            ),
        });
    }
    if version == 1 {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(V1_TO_V2_SQL)?;
        meta_set_tx(&tx, META_SCHEMA_VERSION, &SCHEMA_VERSION.to_string())?;
        tx.commit()?;
        return Ok(());
    }
    Err(StoreError::MigrationFailed {
        message: format!("store has unsupported schema version {version}"),
    })
}

fn init_meta_tx(tx: &Transaction<'_>) -> Result<(), StoreError> {
    meta_set_tx(tx, META_UIDX, "0")?;
    meta_set_tx(tx, META_LAST_JOB, "")?;
    meta_set_tx(tx, META_RECENT, "[]")?;
    Ok(())
}

fn read_version(conn: &Connection) -> Result<i64, StoreError> {
    let raw = meta_get(conn, META_SCHEMA_VERSION).map_err(|err| StoreError::MigrationFailed {
        message: format!("cannot read schema version: {err}"),
    })?;
    let raw = raw.ok_or_else(|| StoreError::MigrationFailed {
        message: "store has no schema version marker".to_string(),
    })?;
    raw.parse().map_err(|_| StoreError::MigrationFailed {
        message: format!("schema version marker is not a number: {raw:?}"),
    })
}

fn migration_err(message: impl Into<String>) -> StoreError {
    StoreError::MigrationFailed {
        message: message.into(),
    }
}

/// One-time import of the legacy key-value database (`active`/`inactive`
/// tables of JSON documents). The legacy file is opened read-only and never
/// modified; any undecodable row aborts the whole import.
fn import_legacy_tx(tx: &Transaction<'_>, legacy_path: &Path) -> Result<(), StoreError> {
    let legacy = Connection::open_with_flags(legacy_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|err| migration_err(format!("cannot open legacy database: {err}")))?;

    let mut max_uidx: u64 = 0;
    let mut last_job = String::new();
    let mut recent = "[]".to_string();

    // Inactive first so the active table's metadata wins.
    for table in ["inactive", "active"] {
        let mut stmt = legacy
            .prepare(&format!("SELECT key, value FROM {table}"))
            .map_err(|err| migration_err(format!("legacy table {table} is unreadable: {err}")))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|err| migration_err(format!("legacy table {table} is unreadable: {err}")))?;

        for (key, value) in rows {
            match key.as_str() {
                "_currentIndex_" => {
                    let idx: u64 = value.trim().parse().map_err(|_| {
                        migration_err(format!("legacy index counter is not a number: {value:?}"))
                    })?;
                    max_uidx = max_uidx.max(idx);
                    continue;
                }
                "_lastJob_" => {
                    last_job = value;
                    continue;
                }
                "_recentItems_" => {
                    recent = value;
                    continue;
                }
                "_schemaVersion_" | "_lastKey_" | "_itemCount_" | "_checkPoint_" => continue,
                _ => {}
            }

            let job = decode_legacy_job(&key, &value)?;
            max_uidx = max_uidx.max(job.uidx);
            insert_legacy_job_tx(tx, table, &job)?;
        }
    }

    meta_set_tx(tx, META_UIDX, &max_uidx.to_string())?;
    meta_set_tx(tx, META_LAST_JOB, &last_job)?;
    let recent_list: Vec<String> = serde_json::from_str(&recent)
        .map_err(|err| migration_err(format!("legacy recent list is not valid JSON: {err}")))?;
    meta_set_tx(tx, META_RECENT, &encode_string_list(&recent_list))?;
    Ok(())
}

#[derive(Debug)]
struct LegacyJob {
    key: String,
    uidx: u64,
    cmd: Vec<String>,
    reminder: Option<String>,
    pwd: String,
    workspace: Option<String>,
    project: Option<String>,
    host: String,
    user: String,
    env: Vec<(String, String)>,
    create_time_ms: i64,
    start_time_ms: Option<i64>,
    stop_time_ms: Option<i64>,
    pid: Option<i64>,
    rc: Option<i64>,
    logfile: Option<String>,
    isolate: bool,
    auto_job: bool,
    mail_job: bool,
    depends: Vec<DepEdge>,
}

fn insert_legacy_job_tx(
    tx: &Transaction<'_>,
    table: &str,
    job: &LegacyJob,
) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO jobs (key, uidx, state, cmd_json, reminder, pwd, workspace, project, \
             host, user, env_json, create_time_ms, start_time_ms, stop_time_ms, pid, rc, \
             logfile, isolate, auto_job, mail_job) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
             ?17, ?18, ?19, ?20)",
        params![
            job.key,
            job.uidx,
            table,
            encode_string_list(&job.cmd),
            job.reminder,
            job.pwd,
            job.workspace,
            job.project,
            job.host,
            job.user,
            encode_env(&job.env),
            job.create_time_ms,
            job.start_time_ms,
            job.stop_time_ms,
            job.pid,
            job.rc,
            job.logfile,
            job.isolate,
            job.auto_job,
            job.mail_job,
        ],
    )
    .map_err(|err| migration_err(format!("cannot import legacy job {}: {err}", job.key)))?;

    for (ord, edge) in job.depends.iter().enumerate() {
        tx.execute(
            "INSERT INTO job_deps (job_key, depends_on_key, predicate, ord) \
             VALUES (?1, ?2, ?3, ?4)",
            params![job.key, edge.on, edge.predicate.as_str(), ord as i64],
        )
        .map_err(|err| {
            migration_err(format!("cannot import dependencies of {}: {err}", job.key))
        })?;
    }
    Ok(())
}

fn decode_legacy_job(key: &str, value: &str) -> Result<LegacyJob, StoreError> {
    let doc: serde_json::Value = serde_json::from_str(value)
        .map_err(|err| migration_err(format!("legacy job {key} is not valid JSON: {err}")))?;
    let doc = doc
        .as_object()
        .ok_or_else(|| migration_err(format!("legacy job {key} is not a JSON object")))?;

    let uidx = doc
        .get("_uidx")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| migration_err(format!("legacy job {key} has no numeric _uidx")))?;

    let reminder = opt_string(doc, "reminder");
    let mut cmd = string_list(doc, "cmd")
        .map_err(|detail| migration_err(format!("legacy job {key}: {detail}")))?;
    // Reminder-only jobs carried a "(reminder)" placeholder command.
    if reminder.is_some() && cmd == ["(reminder)"] {
        cmd = Vec::new();
    }

    let env_doc = doc
        .get("_env")
        .and_then(serde_json::Value::as_object)
        .cloned()
        .unwrap_or_default();
    let mut env = Vec::with_capacity(env_doc.len());
    for (name, entry) in env_doc {
        let entry = entry.as_str().ok_or_else(|| {
            migration_err(format!("legacy job {key} env value {name} is not a string"))
        })?;
        env.push((name, entry.to_string()));
    }

    let create_time_ms = match doc.get("_create") {
        Some(raw) if !raw.is_null() => legacy_time_ms(raw)
            .map_err(|detail| migration_err(format!("legacy job {key} _create: {detail}")))?,
        _ => return Err(migration_err(format!("legacy job {key} has no create time"))),
    };
    let start_time_ms = opt_legacy_time_ms(doc, "_start")
        .map_err(|detail| migration_err(format!("legacy job {key} _start: {detail}")))?;
    let stop_time_ms = opt_legacy_time_ms(doc, "_stop")
        .map_err(|detail| migration_err(format!("legacy job {key} _stop: {detail}")))?;

    let depends = match doc.get("_depends") {
        None | Some(serde_json::Value::Null) => Vec::new(),
        Some(serde_json::Value::Array(items)) => {
            let mut edges = Vec::with_capacity(items.len());
            for item in items {
                let on = item.as_str().ok_or_else(|| {
                    migration_err(format!("legacy job {key} dependency is not a string"))
                })?;
                edges.push(DepEdge {
                    on: on.to_string(),
                    predicate: DepPredicate::AnyExit,
                });
            }
            edges
        }
        Some(other) => {
            return Err(migration_err(format!(
                "legacy job {key} _depends is not a list: {other}"
            )));
        }
    };

    Ok(LegacyJob {
        key: key.to_string(),
        uidx,
        cmd,
        reminder,
        pwd: opt_string(doc, "pwd").unwrap_or_default(),
        workspace: opt_string(doc, "_workspace"),
        project: opt_string(doc, "_proj"),
        host: opt_string(doc, "_host").unwrap_or_default(),
        user: opt_string(doc, "_user").unwrap_or_default(),
        env,
        create_time_ms,
        start_time_ms,
        stop_time_ms,
        pid: doc.get("pid").and_then(serde_json::Value::as_i64),
        rc: doc.get("_rc").and_then(serde_json::Value::as_i64),
        logfile: opt_string(doc, "logfile"),
        isolate: opt_bool(doc, "_isolate"),
        auto_job: opt_bool(doc, "_autoJob"),
        mail_job: opt_bool(doc, "_mailJob"),
        depends,
    })
}

fn opt_string(doc: &serde_json::Map<String, serde_json::Value>, field: &str) -> Option<String> {
    doc.get(field)
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}

fn opt_bool(doc: &serde_json::Map<String, serde_json::Value>, field: &str) -> bool {
    doc.get(field)
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

fn string_list(
    doc: &serde_json::Map<String, serde_json::Value>,
    field: &str,
) -> Result<Vec<String>, String> {
    match doc.get(field) {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let item = item
                    .as_str()
                    .ok_or_else(|| format!("{field} entry is not a string"))?;
                out.push(item.to_string());
            }
            Ok(out)
        }
        Some(other) => Err(format!("{field} is not a list: {other}")),
    }
}

fn opt_legacy_time_ms(
    doc: &serde_json::Map<String, serde_json::Value>,
    field: &str,
) -> Result<Option<i64>, String> {
    match doc.get(field) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(raw) => legacy_time_ms(raw).map(Some),
    }
}

/// Legacy timestamps are UTC component arrays:
/// `[year, month, day, hour, minute, second, microsecond]`.
fn legacy_time_ms(raw: &serde_json::Value) -> Result<i64, String> {
    let parts = raw
        .as_array()
        .ok_or_else(|| format!("timestamp is not an array: {raw}"))?;
    if parts.len() != 7 {
        return Err(format!("timestamp has {} components, expected 7", parts.len()));
    }
    let mut nums = [0i64; 7];
    for (slot, part) in nums.iter_mut().zip(parts) {
        *slot = part
            .as_i64()
            .ok_or_else(|| format!("timestamp component is not a number: {part}"))?;
    }

    let month = u8::try_from(nums[1])
        .ok()
        .and_then(|m| Month::try_from(m).ok())
        .ok_or_else(|| format!("bad month {}", nums[1]))?;
    let date = Date::from_calendar_date(nums[0] as i32, month, nums[2] as u8)
        .map_err(|err| format!("bad calendar date: {err}"))?;
    let time = Time::from_hms_micro(
        nums[3] as u8,
        nums[4] as u8,
        nums[5] as u8,
        nums[6] as u32,
    )
    .map_err(|err| format!("bad time of day: {err}"))?;

    let stamp = PrimitiveDateTime::new(date, time).assume_utc();
    Ok((stamp.unix_timestamp_nanos() / 1_000_000) as i64)
}
