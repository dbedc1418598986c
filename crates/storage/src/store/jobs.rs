#![forbid(unsafe_code)]

use super::{
    FindOrder, JobCreateRequest, JobRecord, JobUpdateRequest, JobsFindRequest, Partition,
    SqliteStore, StoreError, StoreWriter, decode_env, decode_string_list, deps, encode_env,
    encode_string_list, next_uidx_tx, now_ms, push_recent_tx, set_last_job_tx,
};
use jt_core::keys::{JobKey, escape_key_fragment};
use jt_core::model::{DepEdge, JobStatus};
use rusqlite::{Connection, OptionalExtension, Transaction, params, params_from_iter};

const JOB_COLUMNS: &str = "key, uidx, state, cmd_json, reminder, pwd, workspace, project, \
     host, user, env_json, create_time_ms, start_time_ms, stop_time_ms, pid, rc, \
     logfile, isolate, auto_job, mail_job";

/// Raw row image before JSON columns are decoded.
struct JobRow {
    key: String,
    uidx: u64,
    state: String,
    cmd_json: String,
    reminder: Option<String>,
    pwd: String,
    workspace: Option<String>,
    project: Option<String>,
    host: String,
    user: String,
    env_json: String,
    create_time_ms: i64,
    start_time_ms: Option<i64>,
    stop_time_ms: Option<i64>,
    pid: Option<i64>,
    rc: Option<i64>,
    logfile: Option<String>,
    isolate: bool,
    auto_job: bool,
    mail_job: bool,
}

fn read_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        key: row.get(0)?,
        uidx: row.get(1)?,
        state: row.get(2)?,
        cmd_json: row.get(3)?,
        reminder: row.get(4)?,
        pwd: row.get(5)?,
        workspace: row.get(6)?,
        project: row.get(7)?,
        host: row.get(8)?,
        user: row.get(9)?,
        env_json: row.get(10)?,
        create_time_ms: row.get(11)?,
        start_time_ms: row.get(12)?,
        stop_time_ms: row.get(13)?,
        pid: row.get(14)?,
        rc: row.get(15)?,
        logfile: row.get(16)?,
        isolate: row.get(17)?,
        auto_job: row.get(18)?,
        mail_job: row.get(19)?,
    })
}

fn job_from_row(row: JobRow, depends: Vec<DepEdge>) -> Result<JobRecord, StoreError> {
    let partition = Partition::parse(&row.state).ok_or_else(|| {
        StoreError::invalid(format!("job {} has unknown state {:?}", row.key, row.state))
    })?;
    Ok(JobRecord {
        key: row.key,
        uidx: row.uidx,
        partition,
        cmd: decode_string_list(&row.cmd_json)?,
        reminder: row.reminder,
        pwd: row.pwd,
        workspace: row.workspace,
        project: row.project,
        host: row.host,
        user: row.user,
        env: decode_env(&row.env_json)?,
        create_time_ms: row.create_time_ms,
        start_time_ms: row.start_time_ms,
        stop_time_ms: row.stop_time_ms,
        pid: row.pid,
        rc: row.rc,
        logfile: row.logfile,
        isolate: row.isolate,
        auto_job: row.auto_job,
        mail_job: row.mail_job,
        depends,
    })
}

pub(crate) fn load_job(conn: &Connection, key: &str) -> Result<Option<JobRecord>, StoreError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE key = ?1");
    let row = conn
        .query_row(&sql, params![key], read_job_row)
        .optional()?;
    let Some(row) = row else {
        return Ok(None);
    };
    let depends = deps::load_edges(conn, key)?;
    Ok(Some(job_from_row(row, depends)?))
}

/// Key generator for jobs created without an explicit key: epoch seconds,
/// the unique index, and the escaped program name.
pub(crate) fn generate_key(created_ms: i64, uidx: u64, cmd: &[String]) -> String {
    let prog = cmd
        .first()
        .map(|p| p.rsplit('/').next().unwrap_or(p.as_str()))
        .unwrap_or("reminder");
    format!("{}{uidx}_{}", created_ms / 1000, escape_key_fragment(prog))
}

/// Column values for a freshly created job row.
pub(crate) struct NewJobRow<'a> {
    pub key: &'a str,
    pub uidx: u64,
    pub cmd: &'a [String],
    pub reminder: Option<&'a str>,
    pub pwd: &'a str,
    pub workspace: Option<&'a str>,
    pub project: Option<&'a str>,
    pub host: &'a str,
    pub user: &'a str,
    pub env: &'a [(String, String)],
    pub create_time_ms: i64,
    pub logfile: Option<&'a str>,
    pub isolate: bool,
    pub auto_job: bool,
    pub mail_job: bool,
}

pub(crate) fn insert_job_row_tx(tx: &Transaction<'_>, row: &NewJobRow<'_>) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO jobs (key, uidx, state, cmd_json, reminder, pwd, workspace, project, \
             host, user, env_json, create_time_ms, start_time_ms, stop_time_ms, pid, rc, \
             logfile, isolate, auto_job, mail_job) \
         VALUES (?1, ?2, 'active', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL, NULL, \
             NULL, NULL, ?12, ?13, ?14, ?15)",
        params![
            row.key,
            row.uidx,
            encode_string_list(row.cmd),
            row.reminder,
            row.pwd,
            row.workspace,
            row.project,
            row.host,
            row.user,
            encode_env(row.env),
            row.create_time_ms,
            row.logfile,
            row.isolate,
            row.auto_job,
            row.mail_job,
        ],
    )?;
    Ok(())
}

impl SqliteStore {
    pub fn job_get(&self, key: &str) -> Result<Option<JobRecord>, StoreError> {
        load_job(self.conn(), key)
    }

    /// Filtered job search. Partition, workspace and time predicates hit
    /// indexed columns; the status filter is translated into predicates on
    /// the timestamp and rc columns.
    pub fn jobs_find(&self, request: &JobsFindRequest) -> Result<Vec<JobRecord>, StoreError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(partition) = request.partition {
            args.push(partition.as_str().to_string().into());
            clauses.push(format!("state = ?{}", args.len()));
        }
        if let Some(status) = request.status {
            clauses.push(
                match status {
                    JobStatus::Pending => "start_time_ms IS NULL AND stop_time_ms IS NULL",
                    JobStatus::Running => "start_time_ms IS NOT NULL AND stop_time_ms IS NULL",
                    JobStatus::Succeeded => "stop_time_ms IS NOT NULL AND rc = 0",
                    JobStatus::Failed => {
                        "stop_time_ms IS NOT NULL AND (rc IS NULL OR rc <> 0)"
                    }
                }
                .to_string(),
            );
        }
        if let Some(workspace) = &request.workspace {
            args.push(workspace.clone().into());
            clauses.push(format!("workspace = ?{}", args.len()));
        }
        if let Some(project) = &request.project {
            args.push(project.clone().into());
            clauses.push(format!("project = ?{}", args.len()));
        }
        if let Some(since) = request.created_since_ms {
            args.push(since.into());
            clauses.push(format!("create_time_ms >= ?{}", args.len()));
        }
        if let Some(until) = request.created_until_ms {
            args.push(until.into());
            clauses.push(format!("create_time_ms <= ?{}", args.len()));
        }
        if let Some(needle) = &request.cmd_substring {
            args.push(format!("%{}%", like_escape(needle)).into());
            let idx = args.len();
            clauses.push(format!(
                "(cmd_json LIKE ?{idx} ESCAPE '\\' OR reminder LIKE ?{idx} ESCAPE '\\')"
            ));
        }

        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(match request.order {
            FindOrder::CreatedDesc => " ORDER BY create_time_ms DESC, uidx DESC",
            FindOrder::CreatedAsc => " ORDER BY create_time_ms ASC, uidx ASC",
        });
        if let Some(limit) = request.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), read_job_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let depends = deps::load_edges(self.conn(), &row.key)?;
            jobs.push(job_from_row(row, depends)?);
        }
        Ok(jobs)
    }

    /// Resolves a user-facing job alias to one job.
    ///
    /// `"."` means the most recently created non-auto job. Anything else is
    /// tried as an exact key first, then as a command substring, preferring
    /// matches in the caller's workspace, then the recent-history list.
    pub fn job_match(
        &self,
        query: &str,
        workspace: Option<&str>,
    ) -> Result<JobRecord, StoreError> {
        if query == "." {
            let last = self.last_job()?.ok_or_else(|| StoreError::NotFound {
                key: query.to_string(),
            })?;
            return self.job_get(&last)?.ok_or(StoreError::NotFound { key: last });
        }

        if let Some(job) = self.job_get(query)? {
            return Ok(job);
        }

        let candidates = self.jobs_find(&JobsFindRequest {
            cmd_substring: Some(query.to_string()),
            ..JobsFindRequest::default()
        })?;
        if let Some(ws) = workspace {
            if let Some(job) = candidates
                .iter()
                .find(|job| job.workspace.as_deref() == Some(ws))
            {
                return Ok(job.clone());
            }
        }
        let recent = self.recent_keys()?;
        if let Some(job) = recent
            .iter()
            .find_map(|key| candidates.iter().find(|job| &job.key == key))
        {
            return Ok(job.clone());
        }
        candidates
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound {
                key: query.to_string(),
            })
    }
}

impl StoreWriter<'_> {
    pub fn job_create(&mut self, request: JobCreateRequest) -> Result<JobRecord, StoreError> {
        if request.cmd.is_empty() && request.reminder.is_none() {
            return Err(StoreError::invalid("job needs a command or a reminder"));
        }

        let created_ms = now_ms();
        let tx = self.transaction()?;

        let uidx = next_uidx_tx(&tx)?;
        let key = match &request.key {
            Some(explicit) => JobKey::try_new(explicit.clone())
                .map_err(|err| StoreError::invalid(err.message()))?
                .as_str()
                .to_string(),
            None => generate_key(created_ms, uidx, &request.cmd),
        };

        let exists = tx
            .query_row("SELECT 1 FROM jobs WHERE key = ?1", params![key], |_| Ok(()))
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::DuplicateKey { key });
        }

        deps::validate_edges_tx(&tx, &key, &request.depends)?;

        insert_job_row_tx(
            &tx,
            &NewJobRow {
                key: &key,
                uidx,
                cmd: &request.cmd,
                reminder: request.reminder.as_deref(),
                pwd: &request.pwd,
                workspace: request.workspace.as_deref(),
                project: request.project.as_deref(),
                host: &request.host,
                user: &request.user,
                env: &request.env,
                create_time_ms: created_ms,
                logfile: request.logfile.as_deref(),
                isolate: request.isolate,
                auto_job: request.auto_job,
                mail_job: request.mail_job,
            },
        )?;
        deps::insert_edges_tx(&tx, &key, &request.depends)?;

        if !request.auto_job {
            set_last_job_tx(&tx, &key)?;
        }
        tx.commit()?;

        Ok(JobRecord {
            key,
            uidx,
            partition: Partition::Active,
            cmd: request.cmd,
            reminder: request.reminder,
            pwd: request.pwd,
            workspace: request.workspace,
            project: request.project,
            host: request.host,
            user: request.user,
            env: request.env,
            create_time_ms: created_ms,
            start_time_ms: None,
            stop_time_ms: None,
            pid: None,
            rc: None,
            logfile: request.logfile,
            isolate: request.isolate,
            auto_job: request.auto_job,
            mail_job: request.mail_job,
            depends: request.depends,
        })
    }

    /// Marks a job running. Re-delivery with the same pid is a no-op;
    /// a different pid or a terminal job is rejected.
    pub fn job_started(
        &mut self,
        key: &str,
        pid: i64,
        started_at_ms: i64,
    ) -> Result<(), StoreError> {
        let tx = self.transaction()?;
        let row = lifecycle_row_tx(&tx, key)?;

        if row.stop_time_ms.is_some() {
            return Err(StoreError::invalid(format!(
                "job {key} already finished; it cannot start again"
            )));
        }
        if let Some(existing) = row.start_time_ms {
            if row.pid == Some(pid) {
                return Ok(());
            }
            return Err(StoreError::invalid(format!(
                "job {key} already started at {existing} with pid {:?}",
                row.pid
            )));
        }

        let started = started_at_ms.max(row.create_time_ms);
        tx.execute(
            "UPDATE jobs SET start_time_ms = ?2, pid = ?3 WHERE key = ?1",
            params![key, started, pid],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Records the terminal state and moves the job to the inactive
    /// partition in the same transaction. Re-delivery with the same exit
    /// code is a no-op; a conflicting exit code is rejected.
    pub fn job_finished(
        &mut self,
        key: &str,
        exit_code: i64,
        stopped_at_ms: i64,
    ) -> Result<(), StoreError> {
        let tx = self.transaction()?;
        let row = lifecycle_row_tx(&tx, key)?;

        if row.stop_time_ms.is_some() {
            if row.rc == Some(exit_code) {
                return Ok(());
            }
            return Err(StoreError::invalid(format!(
                "job {key} already finished with rc {:?}, got {exit_code}",
                row.rc
            )));
        }

        let floor = row.start_time_ms.unwrap_or(row.create_time_ms);
        let stopped = stopped_at_ms.max(floor);
        tx.execute(
            "UPDATE jobs SET stop_time_ms = ?2, rc = ?3, state = 'inactive' WHERE key = ?1",
            params![key, stopped, exit_code],
        )?;
        push_recent_tx(&tx, key)?;
        tx.commit()?;
        Ok(())
    }

    /// Updates non-lifecycle metadata. Fields left `None` are untouched.
    pub fn job_update(
        &mut self,
        key: &str,
        request: JobUpdateRequest,
    ) -> Result<JobRecord, StoreError> {
        if request.is_empty() {
            return match self.job_get(key)? {
                Some(job) => Ok(job),
                None => Err(StoreError::NotFound {
                    key: key.to_string(),
                }),
            };
        }
        let tx = self.transaction()?;
        if !tx_job_exists(&tx, key)? {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }

        if let Some(reminder) = &request.reminder {
            tx.execute(
                "UPDATE jobs SET reminder = ?2 WHERE key = ?1",
                params![key, reminder],
            )?;
        }
        if let Some(workspace) = &request.workspace {
            tx.execute(
                "UPDATE jobs SET workspace = ?2 WHERE key = ?1",
                params![key, workspace],
            )?;
        }
        if let Some(project) = &request.project {
            tx.execute(
                "UPDATE jobs SET project = ?2 WHERE key = ?1",
                params![key, project],
            )?;
        }
        if let Some(logfile) = &request.logfile {
            tx.execute(
                "UPDATE jobs SET logfile = ?2 WHERE key = ?1",
                params![key, logfile],
            )?;
        }
        if let Some(mail_job) = request.mail_job {
            tx.execute(
                "UPDATE jobs SET mail_job = ?2 WHERE key = ?1",
                params![key, mail_job],
            )?;
        }
        tx.commit()?;

        load_job(self.conn(), key)?.ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })
    }
}

struct LifecycleRow {
    create_time_ms: i64,
    start_time_ms: Option<i64>,
    stop_time_ms: Option<i64>,
    pid: Option<i64>,
    rc: Option<i64>,
}

fn lifecycle_row_tx(tx: &Transaction<'_>, key: &str) -> Result<LifecycleRow, StoreError> {
    tx.query_row(
        "SELECT create_time_ms, start_time_ms, stop_time_ms, pid, rc FROM jobs WHERE key = ?1",
        params![key],
        |row| {
            Ok(LifecycleRow {
                create_time_ms: row.get(0)?,
                start_time_ms: row.get(1)?,
                stop_time_ms: row.get(2)?,
                pid: row.get(3)?,
                rc: row.get(4)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound {
        key: key.to_string(),
    })
}

fn tx_job_exists(tx: &Transaction<'_>, key: &str) -> Result<bool, StoreError> {
    let hit = tx
        .query_row("SELECT 1 FROM jobs WHERE key = ?1", params![key], |_| Ok(()))
        .optional()?;
    Ok(hit.is_some())
}

fn like_escape(needle: &str) -> String {
    needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
