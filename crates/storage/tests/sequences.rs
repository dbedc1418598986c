use jt_core::model::{DepEdge, DepPredicate};
use jt_storage::{DB_FILE, JobCreateRequest, SqliteStore, StoreError};
use rusqlite::Connection;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const LOCK_WAIT: Duration = Duration::from_secs(5);

fn temp_store_dir(label: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be monotonic enough for tests")
        .as_nanos();
    path.push(format!("jt-seq-{label}-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&path).expect("temp store dir must be creatable");
    path
}

fn keyed_req(key: &str, cmd: &[&str], deps: &[(&str, DepPredicate)]) -> JobCreateRequest {
    JobCreateRequest {
        key: Some(key.to_string()),
        cmd: cmd.iter().map(|s| s.to_string()).collect(),
        reminder: None,
        pwd: "/tmp".to_string(),
        workspace: None,
        project: None,
        host: "testhost".to_string(),
        user: "tester".to_string(),
        env: Vec::new(),
        depends: deps
            .iter()
            .map(|(on, predicate)| DepEdge {
                on: on.to_string(),
                predicate: *predicate,
            })
            .collect(),
        logfile: None,
        isolate: false,
        auto_job: false,
        mail_job: false,
    }
}

fn seed_chain(store: &mut SqliteStore) {
    let mut writer = store.exclusive(LOCK_WAIT).expect("lock");
    writer
        .job_create(keyed_req("fetch", &["git", "fetch"], &[]))
        .expect("fetch");
    writer
        .job_create(keyed_req(
            "build",
            &["make", "all"],
            &[("fetch", DepPredicate::SuccessOnly)],
        ))
        .expect("build");
    writer
        .job_create(keyed_req(
            "test",
            &["make", "check"],
            &[("build", DepPredicate::AnyExit)],
        ))
        .expect("test");
}

#[test]
fn record_snapshots_the_closure_dependencies_first() {
    let dir = temp_store_dir("record");
    let mut store = SqliteStore::open(&dir, LOCK_WAIT).expect("fresh store should open");
    seed_chain(&mut store);

    let record = store
        .exclusive(LOCK_WAIT)
        .expect("lock")
        .sequence_record("nightly", "test")
        .expect("record");

    assert_eq!(record.name, "nightly");
    assert_eq!(record.root_key, "test");
    let sources: Vec<&str> = record.steps.iter().map(|s| s.source_key.as_str()).collect();
    assert_eq!(sources, ["fetch", "build", "test"]);
    assert_eq!(record.steps[1].cmd, vec!["make", "all"]);

    assert_eq!(record.edges.len(), 2);
    assert!(record
        .edges
        .iter()
        .any(|e| e.step == 1 && e.depends_on_step == 0 && e.predicate == DepPredicate::SuccessOnly));
    assert!(record
        .edges
        .iter()
        .any(|e| e.step == 2 && e.depends_on_step == 1 && e.predicate == DepPredicate::AnyExit));

    let listed = store.sequence_list().expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "nightly");

    let fetched = store.sequence_get("nightly").expect("get").expect("exists");
    assert_eq!(fetched.steps.len(), 3);
}

#[test]
fn record_rejects_bad_names_duplicates_and_unknown_roots() {
    let dir = temp_store_dir("record-errors");
    let mut store = SqliteStore::open(&dir, LOCK_WAIT).expect("fresh store should open");
    seed_chain(&mut store);
    let mut writer = store.exclusive(LOCK_WAIT).expect("lock");

    let err = writer
        .sequence_record("bad name", "test")
        .expect_err("name with a space must fail");
    assert_eq!(err.code(), "INVALID_NAME");

    writer.sequence_record("nightly", "test").expect("record");
    let err = writer
        .sequence_record("nightly", "test")
        .expect_err("same name twice must fail");
    assert!(matches!(err, StoreError::SequenceExists { .. }));

    let err = writer
        .sequence_record("orphan", "no-such-job")
        .expect_err("unknown root must fail");
    assert!(matches!(err, StoreError::NotFound { .. }));
}

#[test]
fn record_skips_dependencies_that_no_longer_exist() {
    let dir = temp_store_dir("record-dangling");
    let mut store = SqliteStore::open(&dir, LOCK_WAIT).expect("fresh store should open");

    {
        let mut writer = store.exclusive(LOCK_WAIT).expect("lock");
        writer
            .job_create(keyed_req(
                "lonely",
                &["true"],
                &[("vanished", DepPredicate::AnyExit)],
            ))
            .expect("create");
    }

    let record = store
        .exclusive(LOCK_WAIT)
        .expect("lock")
        .sequence_record("short", "lonely")
        .expect("record");
    assert_eq!(record.steps.len(), 1);
    assert!(record.edges.is_empty());
}

#[test]
fn replay_creates_fresh_jobs_wired_like_the_recording() {
    let dir = temp_store_dir("replay");
    let mut store = SqliteStore::open(&dir, LOCK_WAIT).expect("fresh store should open");
    seed_chain(&mut store);

    {
        let mut writer = store.exclusive(LOCK_WAIT).expect("lock");
        writer.sequence_record("nightly", "test").expect("record");
    }

    let first = store
        .exclusive(LOCK_WAIT)
        .expect("lock")
        .sequence_replay("nightly", 1_800_000_000_000)
        .expect("replay");
    assert_eq!(first.len(), 3);

    // Fresh keys, never the recorded ones.
    for job in &first {
        assert!(!["fetch", "build", "test"].contains(&job.key.as_str()));
        assert_eq!(job.create_time_ms, 1_800_000_000_000);
        assert!(job.start_time_ms.is_none());
    }
    assert_eq!(first[0].cmd, vec!["git", "fetch"]);
    assert_eq!(first[1].depends.len(), 1);
    assert_eq!(first[1].depends[0].on, first[0].key);
    assert_eq!(first[1].depends[0].predicate, DepPredicate::SuccessOnly);
    assert_eq!(first[2].depends[0].on, first[1].key);

    let blocked = store.readiness(&first[2].key).expect("readiness");
    assert!(!blocked.is_ready());

    // Replaying again yields a disjoint job set.
    let second = store
        .exclusive(LOCK_WAIT)
        .expect("lock")
        .sequence_replay("nightly", 1_800_000_000_000)
        .expect("replay again");
    let first_keys: Vec<&str> = first.iter().map(|j| j.key.as_str()).collect();
    assert!(second.iter().all(|job| !first_keys.contains(&job.key.as_str())));
}

#[test]
fn replay_of_a_corrupted_sequence_creates_nothing() {
    let dir = temp_store_dir("corrupt");
    let mut store = SqliteStore::open(&dir, LOCK_WAIT).expect("fresh store should open");
    seed_chain(&mut store);
    {
        let mut writer = store.exclusive(LOCK_WAIT).expect("lock");
        writer.sequence_record("nightly", "test").expect("record");
    }

    // Corrupt the stored edges into a cycle behind the store's back.
    let raw = Connection::open(dir.join(DB_FILE)).expect("raw connection");
    raw.execute(
        "INSERT INTO sequence_edges (seq_name, step, depends_on_step, predicate) \
         VALUES ('nightly', 0, 2, 'any_exit')",
        [],
    )
    .expect("edge insert");
    drop(raw);

    let jobs_before: i64 = {
        let raw = Connection::open(dir.join(DB_FILE)).expect("raw connection");
        raw.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))
            .expect("count")
    };

    let err = store
        .exclusive(LOCK_WAIT)
        .expect("lock")
        .sequence_replay("nightly", 1_800_000_000_000)
        .expect_err("cyclic recording must fail");
    assert_eq!(err.code(), "SEQUENCE_CORRUPT");

    let raw = Connection::open(dir.join(DB_FILE)).expect("raw connection");
    let jobs_after: i64 = raw
        .query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))
        .expect("count");
    assert_eq!(jobs_before, jobs_after);
}

#[test]
fn delete_removes_the_recording_once() {
    let dir = temp_store_dir("delete");
    let mut store = SqliteStore::open(&dir, LOCK_WAIT).expect("fresh store should open");
    seed_chain(&mut store);
    {
        let mut writer = store.exclusive(LOCK_WAIT).expect("lock");
        writer.sequence_record("nightly", "test").expect("record");
    }

    let mut writer = store.exclusive(LOCK_WAIT).expect("lock");
    assert!(writer.sequence_delete("nightly").expect("delete"));
    assert!(!writer.sequence_delete("nightly").expect("second delete"));
    drop(writer);

    assert!(store.sequence_get("nightly").expect("get").is_none());
    let err = store
        .exclusive(LOCK_WAIT)
        .expect("lock")
        .sequence_replay("nightly", 0)
        .expect_err("deleted sequence must not replay");
    assert!(matches!(err, StoreError::SequenceNotFound { .. }));
}
