//! Request and response bodies exchanged between the master and workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::WorkerFilter;
use crate::state::{CancelReason, MergeStatus};
use crate::types::{CancelRequest, ChangeId, ChangeInfo, JobArtifacts, MergeRecord, RecordId};

pub const DEFAULT_PAGE_LIMIT: usize = 25;
pub const MAX_PAGE_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub worker_id: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub filters: Vec<WorkerFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobChange {
    pub change_id: ChangeId,
    pub number: u64,
    pub revision: String,
    pub subject: String,
}

impl From<&ChangeInfo> for JobChange {
    fn from(change: &ChangeInfo) -> Self {
        Self {
            change_id: change.change_id.clone(),
            number: change.number,
            revision: change.current_revision.clone(),
            subject: change.subject.clone(),
        }
    }
}

/// Everything a worker needs to run one merge record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub rid: RecordId,
    pub project: String,
    pub queue_name: String,
    pub branch: String,
    pub changes: Vec<JobChange>,
    pub steps: Vec<Vec<String>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub merge_build_env: bool,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// The last step merges; no submit follows a successful run.
    #[serde(default)]
    pub self_merging: bool,
    pub deadline: DateTime<Utc>,
}

impl Job {
    pub fn workspace_id(&self) -> String {
        format!("{}/{}", self.project, self.queue_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResponse {
    #[serde(default)]
    pub job: Option<Job>,
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultReport {
    pub worker_id: String,
    pub status: MergeStatus,
    #[serde(default)]
    pub artifacts: JobArtifacts,
}

/// Answer to a result report. A report against a record that is no longer
/// running is rejected without any state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ReportOutcome {
    Accepted { status: MergeStatus },
    Rejected { current: MergeStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelProbe {
    #[serde(default)]
    pub cancel: Option<CancelRequest>,
}

impl CancelProbe {
    pub fn reason(&self) -> Option<CancelReason> {
        self.cancel.as_ref().map(|cancel| cancel.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelCommand {
    #[serde(default)]
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseCommand {
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub alive: bool,
    pub paused: bool,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Offset/limit pair with defaults and an upper bound applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn new(offset: Option<usize>, limit: Option<usize>) -> Self {
        Self {
            offset: offset.unwrap_or(0),
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
        }
    }

    pub fn slice<T: Clone>(&self, items: &[T]) -> Vec<T> {
        items
            .iter()
            .skip(self.offset)
            .take(self.limit)
            .cloned()
            .collect()
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Total matching items before paging.
    pub count: usize,
    pub offset: usize,
    pub limit: usize,
    pub items: Vec<T>,
}

/// Exact-match filters for queue and history views.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeFilter {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

impl ScopeFilter {
    pub fn matches(&self, project: &str, branch: &str) -> bool {
        self.project.as_deref().map_or(true, |p| p == project)
            && self.branch.as_deref().map_or(true, |b| b == branch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub queue: String,
    pub position: usize,
    pub change: ChangeInfo,
}

pub type HistoryPage = Page<MergeRecord>;
pub type QueuePage = Page<QueueEntry>;
