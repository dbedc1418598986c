#![forbid(unsafe_code)]

use super::jobs::{NewJobRow, generate_key, insert_job_row_tx, load_job};
use super::{
    JobRecord, SequenceEdgeRow, SequenceRecord, SequenceStep, SqliteStore, StoreError,
    StoreWriter, decode_env, decode_string_list, deps, encode_env, encode_string_list,
    next_uidx_tx, now_ms, set_last_job_tx,
};
use jt_core::graph::topo_sort;
use jt_core::keys::SequenceName;
use jt_core::model::{DepEdge, DepPredicate};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::collections::{BTreeMap, BTreeSet};

impl SqliteStore {
    pub fn sequence_get(&self, name: &str) -> Result<Option<SequenceRecord>, StoreError> {
        load_sequence(self.conn(), name)
    }

    /// Every recorded sequence, ordered by name.
    pub fn sequence_list(&self) -> Result<Vec<SequenceRecord>, StoreError> {
        let mut stmt = self
            .conn()
            .prepare("SELECT name FROM sequences ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Some(record) = load_sequence(self.conn(), &name)? {
                out.push(record);
            }
        }
        Ok(out)
    }
}

impl StoreWriter<'_> {
    /// Snapshots `root_key` and its transitive dependencies as a named
    /// sequence. Steps are stored dependencies-first; dependency targets
    /// that no longer exist are skipped, matching readiness reporting.
    pub fn sequence_record(
        &mut self,
        name: &str,
        root_key: &str,
    ) -> Result<SequenceRecord, StoreError> {
        let name = SequenceName::try_new(name).map_err(|err| StoreError::InvalidName {
            message: err.message().to_string(),
        })?;

        let created_at_ms = now_ms();
        let tx = self.transaction()?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM sequences WHERE name = ?1",
                params![name.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::SequenceExists {
                name: name.as_str().to_string(),
            });
        }

        let ordered = collect_deps_first_tx(&tx, root_key)?;
        let index_of: BTreeMap<&str, usize> = ordered
            .iter()
            .enumerate()
            .map(|(idx, job)| (job.key.as_str(), idx))
            .collect();

        tx.execute(
            "INSERT INTO sequences (name, root_key, created_at_ms) VALUES (?1, ?2, ?3)",
            params![name.as_str(), root_key, created_at_ms],
        )?;

        let mut steps = Vec::with_capacity(ordered.len());
        let mut edges = Vec::new();
        for (idx, job) in ordered.iter().enumerate() {
            tx.execute(
                "INSERT INTO sequence_steps (seq_name, step, source_key, cmd_json, reminder, \
                     pwd, workspace, project, host, user, env_json, isolate) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    name.as_str(),
                    idx as i64,
                    job.key,
                    encode_string_list(&job.cmd),
                    job.reminder,
                    job.pwd,
                    job.workspace,
                    job.project,
                    job.host,
                    job.user,
                    encode_env(&job.env),
                    job.isolate,
                ],
            )?;
            steps.push(SequenceStep {
                step: idx,
                source_key: job.key.clone(),
                cmd: job.cmd.clone(),
                reminder: job.reminder.clone(),
                pwd: job.pwd.clone(),
                workspace: job.workspace.clone(),
                project: job.project.clone(),
                host: job.host.clone(),
                user: job.user.clone(),
                env: job.env.clone(),
                isolate: job.isolate,
            });

            for edge in &job.depends {
                let Some(&dep_idx) = index_of.get(edge.on.as_str()) else {
                    continue;
                };
                tx.execute(
                    "INSERT INTO sequence_edges (seq_name, step, depends_on_step, predicate) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        name.as_str(),
                        idx as i64,
                        dep_idx as i64,
                        edge.predicate.as_str()
                    ],
                )?;
                edges.push(SequenceEdgeRow {
                    step: idx,
                    depends_on_step: dep_idx,
                    predicate: edge.predicate,
                });
            }
        }
        tx.commit()?;

        Ok(SequenceRecord {
            name: name.as_str().to_string(),
            root_key: root_key.to_string(),
            created_at_ms,
            steps,
            edges,
        })
    }

    /// Creates a fresh job per recorded step, wiring the recorded edges to
    /// the new keys. Jobs come back in the creation (topological) order.
    /// The whole replay is one transaction: a corrupt sequence creates
    /// nothing.
    pub fn sequence_replay(
        &mut self,
        name: &str,
        now_ms: i64,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let tx = self.transaction()?;
        let record = load_sequence(&tx, name)?.ok_or_else(|| StoreError::SequenceNotFound {
            name: name.to_string(),
        })?;

        let count = record.steps.len();
        for edge in &record.edges {
            if edge.step >= count || edge.depends_on_step >= count {
                return Err(StoreError::SequenceCorrupt {
                    name: name.to_string(),
                    message: format!(
                        "edge {} -> {} is out of range for {count} steps",
                        edge.step, edge.depends_on_step
                    ),
                });
            }
        }

        let index_edges: Vec<(usize, usize)> = record
            .edges
            .iter()
            .map(|edge| (edge.step, edge.depends_on_step))
            .collect();
        let order = topo_sort(count, &index_edges).map_err(|cycle| StoreError::SequenceCorrupt {
            name: name.to_string(),
            message: format!("stored edges form a cycle through steps {:?}", cycle.stuck),
        })?;

        let mut deps_by_step: BTreeMap<usize, Vec<(usize, DepPredicate)>> = BTreeMap::new();
        for edge in &record.edges {
            deps_by_step
                .entry(edge.step)
                .or_default()
                .push((edge.depends_on_step, edge.predicate));
        }

        let mut new_keys: BTreeMap<usize, String> = BTreeMap::new();
        let mut created = Vec::with_capacity(count);
        for &step_idx in &order {
            let step = &record.steps[step_idx];
            let uidx = next_uidx_tx(&tx)?;
            let key = generate_key(now_ms, uidx, &step.cmd);

            insert_job_row_tx(
                &tx,
                &NewJobRow {
                    key: &key,
                    uidx,
                    cmd: &step.cmd,
                    reminder: step.reminder.as_deref(),
                    pwd: &step.pwd,
                    workspace: step.workspace.as_deref(),
                    project: step.project.as_deref(),
                    host: &step.host,
                    user: &step.user,
                    env: &step.env,
                    create_time_ms: now_ms,
                    logfile: None,
                    isolate: step.isolate,
                    auto_job: false,
                    mail_job: false,
                },
            )?;

            let depends: Vec<DepEdge> = deps_by_step
                .get(&step_idx)
                .map(|targets| {
                    targets
                        .iter()
                        .map(|&(dep_step, predicate)| DepEdge {
                            on: new_keys[&dep_step].clone(),
                            predicate,
                        })
                        .collect()
                })
                .unwrap_or_default();
            deps::insert_edges_tx(&tx, &key, &depends)?;

            new_keys.insert(step_idx, key.clone());
            created.push(key);
        }

        if let Some(last) = created.last() {
            set_last_job_tx(&tx, last)?;
        }
        tx.commit()?;

        let mut jobs = Vec::with_capacity(created.len());
        for key in created {
            let job = load_job(self.conn(), &key)?.ok_or_else(|| StoreError::NotFound {
                key: key.clone(),
            })?;
            jobs.push(job);
        }
        Ok(jobs)
    }

    /// Removes a recorded sequence. Returns whether it existed.
    pub fn sequence_delete(&mut self, name: &str) -> Result<bool, StoreError> {
        let tx = self.transaction()?;
        tx.execute("DELETE FROM sequence_edges WHERE seq_name = ?1", params![name])?;
        tx.execute("DELETE FROM sequence_steps WHERE seq_name = ?1", params![name])?;
        let removed = tx.execute("DELETE FROM sequences WHERE name = ?1", params![name])?;
        tx.commit()?;
        Ok(removed > 0)
    }
}

/// Deps-first deterministic ordering of `root` and its transitive
/// dependencies: post-order walk, each job's dependencies in their stored
/// order. Missing dependency targets are skipped.
fn collect_deps_first_tx(
    tx: &Transaction<'_>,
    root: &str,
) -> Result<Vec<JobRecord>, StoreError> {
    let root_job = load_job(tx, root)?.ok_or_else(|| StoreError::NotFound {
        key: root.to_string(),
    })?;

    let mut ordered: Vec<JobRecord> = Vec::new();
    let mut done: BTreeSet<String> = BTreeSet::new();
    // Stack entries: (job, next dependency index to expand).
    let mut stack: Vec<(JobRecord, usize)> = vec![(root_job, 0)];
    while let Some((job, next_dep)) = stack.pop() {
        if done.contains(&job.key) {
            continue;
        }
        if let Some(edge) = job.depends.get(next_dep) {
            let dep_key = edge.on.clone();
            stack.push((job, next_dep + 1));
            if !done.contains(&dep_key)
                && !stack.iter().any(|(pending, _)| pending.key == dep_key)
            {
                if let Some(dep_job) = load_job(tx, &dep_key)? {
                    stack.push((dep_job, 0));
                }
            }
        } else {
            done.insert(job.key.clone());
            ordered.push(job);
        }
    }
    Ok(ordered)
}

fn load_sequence(conn: &Connection, name: &str) -> Result<Option<SequenceRecord>, StoreError> {
    let head = conn
        .query_row(
            "SELECT root_key, created_at_ms FROM sequences WHERE name = ?1",
            params![name],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;
    let Some((root_key, created_at_ms)) = head else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT step, source_key, cmd_json, reminder, pwd, workspace, project, host, user, \
             env_json, isolate \
         FROM sequence_steps WHERE seq_name = ?1 ORDER BY step",
    )?;
    let raw_steps = stmt
        .query_map(params![name], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, bool>(10)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut steps = Vec::with_capacity(raw_steps.len());
    for (step, source_key, cmd_json, reminder, pwd, workspace, project, host, user, env_json, isolate) in
        raw_steps
    {
        steps.push(SequenceStep {
            step: step as usize,
            source_key,
            cmd: decode_string_list(&cmd_json)?,
            reminder,
            pwd,
            workspace,
            project,
            host,
            user,
            env: decode_env(&env_json)?,
            isolate,
        });
    }

    let mut stmt = conn.prepare(
        "SELECT step, depends_on_step, predicate FROM sequence_edges \
         WHERE seq_name = ?1 ORDER BY step, depends_on_step",
    )?;
    let raw_edges = stmt
        .query_map(params![name], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut edges = Vec::with_capacity(raw_edges.len());
    for (step, depends_on_step, predicate) in raw_edges {
        let predicate = DepPredicate::parse(&predicate).ok_or_else(|| {
            StoreError::SequenceCorrupt {
                name: name.to_string(),
                message: format!("unknown predicate {predicate:?} on edge {step}"),
            }
        })?;
        edges.push(SequenceEdgeRow {
            step: step as usize,
            depends_on_step: depends_on_step as usize,
            predicate,
        });
    }

    Ok(Some(SequenceRecord {
        name: name.to_string(),
        root_key,
        created_at_ms,
        steps,
        edges,
    }))
}
