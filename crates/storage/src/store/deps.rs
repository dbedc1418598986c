#![forbid(unsafe_code)]

use super::{JobReadiness, SqliteStore, StoreError};
use jt_core::graph::DepGraph;
use jt_core::model::{DepEdge, DepPredicate, derive_status};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::collections::BTreeSet;

pub(crate) fn load_edges(conn: &Connection, key: &str) -> Result<Vec<DepEdge>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT depends_on_key, predicate FROM job_deps WHERE job_key = ?1 ORDER BY ord",
    )?;
    let rows = stmt
        .query_map(params![key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut edges = Vec::with_capacity(rows.len());
    for (on, predicate) in rows {
        let predicate = DepPredicate::parse(&predicate).ok_or_else(|| {
            StoreError::invalid(format!("job {key} has unknown dependency predicate {predicate:?}"))
        })?;
        edges.push(DepEdge { on, predicate });
    }
    Ok(edges)
}

/// Rejects duplicate edges, self-dependencies, and any edge whose target can
/// already reach the new key through existing edges.
pub(crate) fn validate_edges_tx(
    tx: &Transaction<'_>,
    key: &str,
    edges: &[DepEdge],
) -> Result<(), StoreError> {
    let mut seen = BTreeSet::new();
    for edge in edges {
        if !seen.insert(edge.on.as_str()) {
            return Err(StoreError::invalid(format!(
                "duplicate dependency on {}",
                edge.on
            )));
        }
        if edge.on == key {
            return Err(StoreError::CyclicDependency {
                key: key.to_string(),
                depends_on: edge.on.clone(),
            });
        }
    }
    if edges.is_empty() {
        return Ok(());
    }

    let graph = load_graph_tx(tx)?;
    for edge in edges {
        if graph.reaches(&edge.on, key) {
            return Err(StoreError::CyclicDependency {
                key: key.to_string(),
                depends_on: edge.on.clone(),
            });
        }
    }
    Ok(())
}

pub(crate) fn insert_edges_tx(
    tx: &Transaction<'_>,
    key: &str,
    edges: &[DepEdge],
) -> Result<(), StoreError> {
    for (ord, edge) in edges.iter().enumerate() {
        tx.execute(
            "INSERT INTO job_deps (job_key, depends_on_key, predicate, ord) \
             VALUES (?1, ?2, ?3, ?4)",
            params![key, edge.on, edge.predicate.as_str(), ord as i64],
        )?;
    }
    Ok(())
}

fn load_graph_tx(tx: &Transaction<'_>) -> Result<DepGraph, StoreError> {
    load_graph_rows(tx)
}

fn load_graph_rows(conn: &Connection) -> Result<DepGraph, StoreError> {
    let mut stmt =
        conn.prepare("SELECT job_key, depends_on_key FROM job_deps ORDER BY job_key, ord")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut graph = DepGraph::new();
    let mut current: Option<(String, Vec<String>)> = None;
    for (job, dep) in rows {
        match &mut current {
            Some((key, deps)) if *key == job => deps.push(dep),
            _ => {
                if let Some((key, deps)) = current.take() {
                    graph.insert_edges(key, deps);
                }
                current = Some((job, vec![dep]));
            }
        }
    }
    if let Some((key, deps)) = current {
        graph.insert_edges(key, deps);
    }
    Ok(graph)
}

impl SqliteStore {
    /// Classifies every dependency edge of `key` against the current store
    /// state. Missing targets are reported, never treated as errors.
    pub fn readiness(&self, key: &str) -> Result<JobReadiness, StoreError> {
        let exists = self
            .conn()
            .query_row("SELECT 1 FROM jobs WHERE key = ?1", params![key], |_| Ok(()))
            .optional()?
            .is_some();
        if !exists {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }

        let mut readiness = JobReadiness {
            key: key.to_string(),
            waiting_on: Vec::new(),
            dangling: Vec::new(),
            failed: Vec::new(),
        };
        for edge in load_edges(self.conn(), key)? {
            let target = self
                .conn()
                .query_row(
                    "SELECT start_time_ms, stop_time_ms, rc FROM jobs WHERE key = ?1",
                    params![edge.on],
                    |row| {
                        Ok((
                            row.get::<_, Option<i64>>(0)?,
                            row.get::<_, Option<i64>>(1)?,
                            row.get::<_, Option<i64>>(2)?,
                        ))
                    },
                )
                .optional()?;

            match target {
                None => readiness.dangling.push(edge),
                Some((start, stop, rc)) => {
                    let status = derive_status(start, stop, rc);
                    if !status.is_terminal() {
                        readiness.waiting_on.push(edge);
                    } else if edge.predicate == DepPredicate::SuccessOnly
                        && status != jt_core::model::JobStatus::Succeeded
                    {
                        readiness.failed.push(edge);
                    }
                }
            }
        }
        Ok(readiness)
    }

    /// Transitive dependency keys of `key`, root excluded, in breadth-first
    /// order. Creation-time validation keeps the edge set acyclic, so a
    /// visited set is enough.
    pub fn dependency_closure(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let exists = self
            .conn()
            .query_row("SELECT 1 FROM jobs WHERE key = ?1", params![key], |_| Ok(()))
            .optional()?
            .is_some();
        if !exists {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }
        let graph = load_graph_rows(self.conn())?;
        Ok(graph.closure(key))
    }
}
