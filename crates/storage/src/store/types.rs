#![forbid(unsafe_code)]

use jt_core::model::{DepEdge, JobStatus, derive_status};

/// Which partition a job row lives in. Active rows are the working set the
/// runner polls; finished rows move to the inactive partition and stay there
/// for history queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Active,
    Inactive,
}

impl Partition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// Full materialized job row, dependencies included.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub key: String,
    pub uidx: u64,
    pub partition: Partition,
    pub cmd: Vec<String>,
    pub reminder: Option<String>,
    pub pwd: String,
    pub workspace: Option<String>,
    pub project: Option<String>,
    pub host: String,
    pub user: String,
    pub env: Vec<(String, String)>,
    pub create_time_ms: i64,
    pub start_time_ms: Option<i64>,
    pub stop_time_ms: Option<i64>,
    pub pid: Option<i64>,
    pub rc: Option<i64>,
    pub logfile: Option<String>,
    pub isolate: bool,
    pub auto_job: bool,
    pub mail_job: bool,
    pub depends: Vec<DepEdge>,
}

impl JobRecord {
    /// Lifecycle status derived from the timestamps and exit code. Never
    /// stored; the row is the single source of truth.
    pub fn status(&self) -> JobStatus {
        derive_status(self.start_time_ms, self.stop_time_ms, self.rc)
    }
}

/// Inputs for creating a job. The store generates the key, uidx, creation
/// time, host and user metadata live on the request so callers control them.
#[derive(Debug, Clone)]
pub struct JobCreateRequest {
    /// Explicit key; `None` lets the store generate one.
    pub key: Option<String>,
    pub cmd: Vec<String>,
    pub reminder: Option<String>,
    pub pwd: String,
    pub workspace: Option<String>,
    pub project: Option<String>,
    pub host: String,
    pub user: String,
    pub env: Vec<(String, String)>,
    pub depends: Vec<DepEdge>,
    pub logfile: Option<String>,
    pub isolate: bool,
    pub auto_job: bool,
    pub mail_job: bool,
}

/// Partial update of mutable job metadata. `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdateRequest {
    pub reminder: Option<Option<String>>,
    pub workspace: Option<Option<String>>,
    pub project: Option<Option<String>>,
    pub logfile: Option<Option<String>>,
    pub mail_job: Option<bool>,
}

impl JobUpdateRequest {
    pub fn is_empty(&self) -> bool {
        self.reminder.is_none()
            && self.workspace.is_none()
            && self.project.is_none()
            && self.logfile.is_none()
            && self.mail_job.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FindOrder {
    /// Newest creation first.
    #[default]
    CreatedDesc,
    /// Oldest creation first.
    CreatedAsc,
}

/// Filterable job search. Every field narrows the result; all are optional.
#[derive(Debug, Clone, Default)]
pub struct JobsFindRequest {
    pub partition: Option<Partition>,
    pub status: Option<JobStatus>,
    pub workspace: Option<String>,
    pub project: Option<String>,
    pub created_since_ms: Option<i64>,
    pub created_until_ms: Option<i64>,
    /// Substring matched against the stored command (and reminder text).
    pub cmd_substring: Option<String>,
    pub order: FindOrder,
    pub limit: Option<usize>,
}

/// Readiness verdict for one job against the current store state.
#[derive(Debug, Clone)]
pub struct JobReadiness {
    pub key: String,
    /// Dependencies that exist but have not reached a satisfying state yet.
    pub waiting_on: Vec<DepEdge>,
    /// Dependencies whose target key no longer exists in either partition.
    pub dangling: Vec<DepEdge>,
    /// `success_only` dependencies whose target finished with a nonzero rc.
    pub failed: Vec<DepEdge>,
}

impl JobReadiness {
    pub fn is_ready(&self) -> bool {
        self.waiting_on.is_empty() && self.dangling.is_empty() && self.failed.is_empty()
    }
}

/// One recorded step of a sequence: the command snapshot replay re-issues.
#[derive(Debug, Clone)]
pub struct SequenceStep {
    pub step: usize,
    pub source_key: String,
    pub cmd: Vec<String>,
    pub reminder: Option<String>,
    pub pwd: String,
    pub workspace: Option<String>,
    pub project: Option<String>,
    pub host: String,
    pub user: String,
    pub env: Vec<(String, String)>,
    pub isolate: bool,
}

/// Dependency between two recorded steps, by step index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceEdgeRow {
    pub step: usize,
    pub depends_on_step: usize,
    pub predicate: jt_core::model::DepPredicate,
}

#[derive(Debug, Clone)]
pub struct SequenceRecord {
    pub name: String,
    pub root_key: String,
    pub created_at_ms: i64,
    pub steps: Vec<SequenceStep>,
    pub edges: Vec<SequenceEdgeRow>,
}
