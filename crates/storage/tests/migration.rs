use jt_core::model::JobStatus;
use jt_storage::{
    DB_FILE, JobCreateRequest, LEGACY_DB_FILE, Partition, SqliteStore, StoreError,
};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const LOCK_WAIT: Duration = Duration::from_secs(5);

fn temp_store_dir(label: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be monotonic enough for tests")
        .as_nanos();
    path.push(format!("jt-mig-{label}-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&path).expect("temp store dir must be creatable");
    path
}

fn write_legacy_db(dir: &Path, jobs: &[(&str, &str, serde_json::Value)]) {
    let conn = Connection::open(dir.join(LEGACY_DB_FILE)).expect("legacy db must open");
    for table in ["active", "inactive"] {
        conn.execute(
            &format!("CREATE TABLE {table} (key TEXT PRIMARY KEY, value TEXT)"),
            [],
        )
        .expect("legacy table");
    }
    conn.execute(
        "INSERT INTO active VALUES ('_schemaVersion_', '0'), ('_currentIndex_', '12'), \
             ('_lastJob_', '17093_make'), ('_recentItems_', '[\"17090_old\"]')",
        [],
    )
    .expect("legacy meta");
    for (table, key, value) in jobs {
        conn.execute(
            &format!("INSERT INTO {table} VALUES (?1, ?2)"),
            rusqlite::params![key, value.to_string()],
        )
        .expect("legacy job row");
    }
}

fn legacy_job(uidx: u64, cmd: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "_uidx": uidx,
        "cmd": cmd,
        "pwd": "/home/u/src",
        "_workspace": "src",
        "_proj": "proj",
        "_host": "oldbox",
        "_user": "u",
        "_env": {"PATH": "/usr/bin"},
        "_create": [2024, 3, 1, 12, 0, 0, 0],
        "_autoJob": false,
        "_mailJob": false,
        "_isolate": false,
    })
}

#[test]
fn fresh_store_opens_and_reopens_cleanly() {
    let dir = temp_store_dir("fresh");
    {
        let store = SqliteStore::open(&dir, LOCK_WAIT).expect("fresh store should open");
        assert!(store.last_job().expect("meta").is_none());
        assert!(store.recent_keys().expect("meta").is_empty());
    }
    assert!(dir.join(DB_FILE).exists());

    // Second open is a no-op against the already-current schema.
    let store = SqliteStore::open(&dir, LOCK_WAIT).expect("reopen");
    assert!(store.jobs_find(&Default::default()).expect("find").is_empty());
}

#[test]
fn legacy_key_value_store_is_imported_once() {
    let dir = temp_store_dir("legacy-import");

    let mut finished = legacy_job(7, &["make", "all"]);
    finished["_start"] = serde_json::json!([2024, 3, 1, 12, 0, 5, 0]);
    finished["_stop"] = serde_json::json!([2024, 3, 1, 12, 3, 5, 500_000]);
    finished["_rc"] = serde_json::json!(0);
    finished["pid"] = serde_json::json!(31337);
    finished["logfile"] = serde_json::json!("/tmp/old.log");

    let mut waiting = legacy_job(9, &["make", "install"]);
    waiting["_depends"] = serde_json::json!(["17093_make"]);

    write_legacy_db(
        &dir,
        &[
            ("inactive", "17093_make", finished),
            ("active", "17095_make", waiting),
        ],
    );

    let mut store = SqliteStore::open(&dir, LOCK_WAIT).expect("migrating open");

    let old = store
        .job_get("17093_make")
        .expect("get")
        .expect("imported job must exist");
    assert_eq!(old.uidx, 7);
    assert_eq!(old.partition, Partition::Inactive);
    assert_eq!(old.status(), JobStatus::Succeeded);
    assert_eq!(old.cmd, vec!["make", "all"]);
    assert_eq!(old.pwd, "/home/u/src");
    assert_eq!(old.workspace.as_deref(), Some("src"));
    assert_eq!(old.host, "oldbox");
    assert_eq!(old.env, vec![("PATH".to_string(), "/usr/bin".to_string())]);
    assert_eq!(old.create_time_ms, 1_709_294_400_000);
    assert_eq!(old.start_time_ms, Some(1_709_294_405_000));
    assert_eq!(old.stop_time_ms, Some(1_709_294_585_500));
    assert_eq!(old.pid, Some(31337));
    assert_eq!(old.rc, Some(0));
    assert_eq!(old.logfile.as_deref(), Some("/tmp/old.log"));

    let blocked = store
        .job_get("17095_make")
        .expect("get")
        .expect("imported job must exist");
    assert_eq!(blocked.partition, Partition::Active);
    assert_eq!(blocked.depends.len(), 1);
    assert_eq!(blocked.depends[0].on, "17093_make");
    assert!(store.readiness("17095_make").expect("readiness").is_ready());

    assert_eq!(store.last_job().expect("meta").as_deref(), Some("17093_make"));
    assert_eq!(store.recent_keys().expect("meta"), vec!["17090_old".to_string()]);

    // The counter resumes above every imported index.
    let created = store
        .exclusive(LOCK_WAIT)
        .expect("lock")
        .job_create(JobCreateRequest {
            key: None,
            cmd: vec!["true".to_string()],
            reminder: None,
            pwd: "/tmp".to_string(),
            workspace: None,
            project: None,
            host: "h".to_string(),
            user: "u".to_string(),
            env: Vec::new(),
            depends: Vec::new(),
            logfile: None,
            isolate: false,
            auto_job: false,
            mail_job: false,
        })
        .expect("create after import");
    assert_eq!(created.uidx, 13);

    // The legacy file is untouched and never read again.
    drop(store);
    let legacy = Connection::open(dir.join(LEGACY_DB_FILE)).expect("legacy reopen");
    let rows: i64 = legacy
        .query_row("SELECT COUNT(*) FROM inactive", [], |row| row.get(0))
        .expect("count");
    assert_eq!(rows, 1);
    drop(legacy);

    let store = SqliteStore::open(&dir, LOCK_WAIT).expect("reopen");
    assert_eq!(
        store
            .jobs_find(&Default::default())
            .expect("find")
            .len(),
        3
    );
}

#[test]
fn undecodable_legacy_rows_abort_and_leave_no_half_store() {
    let dir = temp_store_dir("legacy-abort");
    write_legacy_db(
        &dir,
        &[
            ("active", "17095_good", legacy_job(3, &["ls"])),
            ("active", "17096_bad", serde_json::json!({"cmd": ["ls"]})),
        ],
    );

    let err = SqliteStore::open(&dir, LOCK_WAIT).expect_err("bad row must abort the import");
    assert_eq!(err.code(), "MIGRATION_FAILED");
    assert!(
        !dir.join(DB_FILE).exists(),
        "a failed fresh install must remove the new database file"
    );
    assert!(dir.join(LEGACY_DB_FILE).exists());
}

#[test]
fn stores_from_newer_builds_are_refused() {
    let dir = temp_store_dir("newer");
    drop(SqliteStore::open(&dir, LOCK_WAIT).expect("fresh store should open"));

    let conn = Connection::open(dir.join(DB_FILE)).expect("raw connection");
    conn.execute("UPDATE meta SET value = '99' WHERE key = 'schema_version'", [])
        .expect("bump version");
    drop(conn);

    let err = SqliteStore::open(&dir, LOCK_WAIT).expect_err("newer schema must be refused");
    assert!(matches!(err, StoreError::MigrationFailed { .. }));
    assert!(dir.join(DB_FILE).exists(), "a refused store is never deleted");
}

#[test]
fn version_one_stores_gain_predicates_and_sequence_tables() {
    let dir = temp_store_dir("v1-upgrade");

    let conn = Connection::open(dir.join(DB_FILE)).expect("raw connection");
    conn.execute_batch(
        "CREATE TABLE meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
         CREATE TABLE jobs (
           key TEXT PRIMARY KEY,
           uidx INTEGER NOT NULL,
           state TEXT NOT NULL,
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
         CREATE TABLE job_deps (
           job_key TEXT NOT NULL,
           depends_on_key TEXT NOT NULL,
           PRIMARY KEY(job_key, depends_on_key)
         );
         INSERT INTO meta VALUES ('schema_version', '1'), ('uidx', '2'),
             ('last_job', 'old2'), ('recent', '[]');
         INSERT INTO jobs VALUES ('old1', 1, 'active', '[\"true\"]', NULL, '/tmp',
             NULL, NULL, 'h', 'u', '{}', 1000, NULL, NULL, NULL, NULL, NULL, 0, 0, 0);
         INSERT INTO jobs VALUES ('old2', 2, 'active', '[\"true\"]', NULL, '/tmp',
             NULL, NULL, 'h', 'u', '{}', 2000, NULL, NULL, NULL, NULL, NULL, 0, 0, 0);
         INSERT INTO job_deps VALUES ('old2', 'old1');",
    )
    .expect("hand-built v1 store");
    drop(conn);

    let mut store = SqliteStore::open(&dir, LOCK_WAIT).expect("upgrading open");
    let job = store.job_get("old2").expect("get").expect("exists");
    assert_eq!(job.depends.len(), 1);
    assert_eq!(job.depends[0].on, "old1");
    assert_eq!(
        job.depends[0].predicate,
        jt_core::model::DepPredicate::AnyExit
    );

    // The upgrade added the sequence tables.
    let record = store
        .exclusive(LOCK_WAIT)
        .expect("lock")
        .sequence_record("carried", "old2")
        .expect("record against upgraded store");
    assert_eq!(record.steps.len(), 2);
}
