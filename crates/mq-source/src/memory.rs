//! In-process review platform used by engine tests and dry runs.

use async_trait::async_trait;
use mq_core::{AccountInfo, ChangeId, ChangeInfo, ChangeStatus};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::error::SourceError;
use crate::source::{ChangeSource, LabelVote, Notify};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedLabel {
    pub change_id: ChangeId,
    pub label: String,
    pub value: i8,
    pub message: Option<String>,
    pub notify: Notify,
}

#[derive(Debug, Default)]
struct MemoryState {
    changes: BTreeMap<ChangeId, ChangeInfo>,
    votes: BTreeMap<ChangeId, Vec<LabelVote>>,
    accounts: BTreeMap<i64, AccountInfo>,
    submitted: Vec<ChangeId>,
    posted: Vec<PostedLabel>,
    refuse_submit: HashSet<ChangeId>,
    failing_projects: HashSet<String>,
}

/// Keeps changes, votes and accounts in memory and records every write.
#[derive(Debug, Default)]
pub struct MemorySource {
    state: Mutex<MemoryState>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn upsert_change(&self, change: ChangeInfo) {
        self.lock().changes.insert(change.change_id.clone(), change);
    }

    pub fn add_vote(&self, change_id: &ChangeId, vote: LabelVote) {
        self.lock()
            .votes
            .entry(change_id.clone())
            .or_default()
            .push(vote);
    }

    pub fn add_account(&self, account: AccountInfo) {
        self.lock().accounts.insert(account.account_id, account);
    }

    pub fn refuse_submit(&self, change_id: &ChangeId) {
        self.lock().refuse_submit.insert(change_id.clone());
    }

    /// Makes every listing of `project` fail until cleared.
    pub fn set_project_failing(&self, project: &str, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing_projects.insert(project.to_string());
        } else {
            state.failing_projects.remove(project);
        }
    }

    pub fn submitted(&self) -> Vec<ChangeId> {
        self.lock().submitted.clone()
    }

    pub fn posted_labels(&self) -> Vec<PostedLabel> {
        self.lock().posted.clone()
    }
}

fn unavailable(operation: &str, message: String) -> SourceError {
    SourceError::Status {
        operation: operation.to_string(),
        status: 503,
        body: message,
    }
}

fn not_found(operation: &str, what: String) -> SourceError {
    SourceError::Status {
        operation: operation.to_string(),
        status: 404,
        body: format!("{what} not found"),
    }
}

#[async_trait]
impl ChangeSource for MemorySource {
    async fn list_changes(
        &self,
        project: &str,
        _query: &str,
    ) -> Result<Vec<ChangeInfo>, SourceError> {
        let state = self.lock();
        if state.failing_projects.contains(project) {
            return Err(unavailable(
                "list changes",
                format!("project {project} unavailable"),
            ));
        }
        Ok(state
            .changes
            .values()
            .filter(|change| change.project == project && change.status.is_open())
            .map(|change| ChangeInfo {
                votes: BTreeMap::new(),
                request_time: None,
                ..change.clone()
            })
            .collect())
    }

    async fn get_votes(&self, change_id: &ChangeId) -> Result<Vec<LabelVote>, SourceError> {
        let state = self.lock();
        if !state.changes.contains_key(change_id) {
            return Err(not_found("get votes", format!("change {change_id}")));
        }
        Ok(state.votes.get(change_id).cloned().unwrap_or_default())
    }

    async fn post_label(
        &self,
        change_id: &ChangeId,
        _revision: &str,
        label: &str,
        value: i8,
        message: Option<&str>,
        notify: Notify,
    ) -> Result<(), SourceError> {
        let mut state = self.lock();
        if !state.changes.contains_key(change_id) {
            return Err(not_found("post label", format!("change {change_id}")));
        }
        state.posted.push(PostedLabel {
            change_id: change_id.clone(),
            label: label.to_string(),
            value,
            message: message.map(str::to_string),
            notify,
        });
        Ok(())
    }

    async fn submit_merge(&self, change_id: &ChangeId) -> Result<(), SourceError> {
        let mut state = self.lock();
        if state.refuse_submit.contains(change_id) {
            return Err(SourceError::Status {
                operation: "submit".to_string(),
                status: 409,
                body: format!("change {change_id} is not mergeable"),
            });
        }
        let Some(change) = state.changes.get_mut(change_id) else {
            return Err(not_found("submit", format!("change {change_id}")));
        };
        change.status = ChangeStatus::Merged;
        state.submitted.push(change_id.clone());
        Ok(())
    }

    async fn fetch_account(&self, account_id: i64) -> Result<AccountInfo, SourceError> {
        self.lock()
            .accounts
            .get(&account_id)
            .cloned()
            .ok_or_else(|| not_found("fetch account", format!("account {account_id}")))
    }
}
