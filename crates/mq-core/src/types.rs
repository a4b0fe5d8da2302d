//! Core types for the merge queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::labels::{self, Vote, CODE_REVIEW_LABEL, MERGE_QUEUE_LABEL};
use crate::meta::CommitMeta;
use crate::state::{CancelReason, MergeStatus};

/// Review-platform change identifier (`project~branch~Change-Id` triplet).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(pub String);

impl ChangeId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChangeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Merge record id. Monotonic across restarts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl RecordId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RecordId {
    type Err = std::num::ParseIntError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value.trim().parse().map(RecordId)
    }
}

/// Identity of one configured queue: project plus queue name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueKey {
    pub project: String,
    pub name: String,
}

impl QueueKey {
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            name: name.into(),
        }
    }
}

/// Rendered as `project/name`, which is also the workspace identifier.
impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl AccountInfo {
    pub fn unknown(account_id: i64) -> Self {
        Self {
            account_id,
            name: None,
            email: None,
            username: None,
        }
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.username.clone())
            .or_else(|| self.email.clone())
            .unwrap_or_else(|| format!("account {}", self.account_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeStatus {
    #[default]
    New,
    Merged,
    Abandoned,
}

impl ChangeStatus {
    pub fn is_open(self) -> bool {
        matches!(self, ChangeStatus::New)
    }
}

/// Per-poll snapshot of one change and its review metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeInfo {
    pub change_id: ChangeId,
    pub number: u64,
    pub project: String,
    pub branch: String,
    #[serde(default)]
    pub subject: String,
    pub owner_id: i64,
    #[serde(default)]
    pub status: ChangeStatus,
    pub current_revision: String,
    #[serde(default)]
    pub patchset: u32,
    pub updated: DateTime<Utc>,
    /// Raw vote history keyed by label name.
    #[serde(default)]
    pub votes: BTreeMap<String, Vec<Vote>>,
    #[serde(default)]
    pub meta: CommitMeta,
    #[serde(default)]
    pub request_time: Option<DateTime<Utc>>,
}

impl ChangeInfo {
    pub fn label_votes(&self, label: &str) -> &[Vote] {
        self.votes.get(label).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn label_score(&self, label: &str) -> i8 {
        labels::resolve_score(self.label_votes(label))
    }

    pub fn review_score(&self) -> i8 {
        self.label_score(CODE_REVIEW_LABEL)
    }

    pub fn queue_score(&self) -> i8 {
        self.label_score(MERGE_QUEUE_LABEL)
    }

    pub fn priority(&self) -> i64 {
        self.meta.priority()
    }

    /// Recomputes the request time from the vote history of `label`.
    pub fn with_request_time_from(mut self, label: &str) -> Self {
        self.request_time = labels::request_time(self.label_votes(label));
        self
    }

    /// Request time, falling back to the last update for changes that were
    /// never requested.
    pub fn effective_request_time(&self) -> DateTime<Utc> {
        self.request_time.unwrap_or(self.updated)
    }

    /// Dispatch ordering: priority, then request time, then change id.
    pub fn dispatch_cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority()
            .cmp(&other.priority())
            .then_with(|| {
                self.effective_request_time()
                    .cmp(&other.effective_request_time())
            })
            .then_with(|| self.change_id.cmp(&other.change_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub reason: CancelReason,
    #[serde(default)]
    pub requested_by: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub index: usize,
    pub argv: Vec<String>,
    /// `None` when the step was killed or never produced an exit code.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl StepReport {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRefs {
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub log: Option<String>,
}

/// Output and log references attributed to a merge record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobArtifacts {
    #[serde(default)]
    pub steps: Vec<StepReport>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub logs: LogRefs,
    #[serde(default)]
    pub messages: Vec<String>,
}

impl JobArtifacts {
    pub fn note(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }
}

/// One attempt to verify and merge one or more changes as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub rid: RecordId,
    pub project: String,
    pub queue_name: String,
    pub branch: String,
    pub changes: Vec<ChangeInfo>,
    pub status: MergeStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Set once every change of the record landed on its branch.
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    /// Changes merged so far, in submit order.
    #[serde(default)]
    pub landed: Vec<ChangeId>,
    /// Why the review platform refused to merge the rest of the record.
    #[serde(default)]
    pub submit_error: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel: Option<CancelRequest>,
    #[serde(default)]
    pub artifacts: JobArtifacts,
}

impl MergeRecord {
    pub fn queue_key(&self) -> QueueKey {
        QueueKey::new(&self.project, &self.queue_name)
    }

    pub fn workspace_id(&self) -> String {
        self.queue_key().to_string()
    }

    pub fn change_ids(&self) -> impl Iterator<Item = &ChangeId> {
        self.changes.iter().map(|change| &change.change_id)
    }

    pub fn contains_change(&self, change_id: &ChangeId) -> bool {
        self.change_ids().any(|id| id == change_id)
    }

    pub fn was_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted_at.is_some()
    }

    pub fn submit_refused(&self) -> bool {
        self.submit_error.is_some()
    }

    pub fn has_landed(&self, change_id: &ChangeId) -> bool {
        self.is_submitted() || self.landed.contains(change_id)
    }

    /// Changes of the record that are not merged yet.
    pub fn unlanded(&self) -> impl Iterator<Item = &ChangeInfo> {
        self.changes
            .iter()
            .filter(|change| !self.has_landed(&change.change_id))
    }
}
