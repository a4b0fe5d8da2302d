//! Access to the review platform.
//!
//! The engine only talks to the platform through [`ChangeSource`], so polling,
//! writeback and merging can be exercised against [`crate::MemorySource`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mq_core::{AccountInfo, ChangeId, ChangeInfo, Vote};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::SourceError;

/// One vote as reported by the platform, with its label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelVote {
    pub account_id: i64,
    pub label: String,
    pub value: i8,
    pub at: DateTime<Utc>,
}

/// Groups votes by label, each list ordered by time.
pub fn group_votes(votes: Vec<LabelVote>) -> BTreeMap<String, Vec<Vote>> {
    let mut grouped: BTreeMap<String, Vec<Vote>> = BTreeMap::new();
    for vote in votes {
        grouped
            .entry(vote.label)
            .or_default()
            .push(Vote::new(vote.account_id, vote.value, vote.at));
    }
    for history in grouped.values_mut() {
        history.sort_by_key(|vote| vote.at);
    }
    grouped
}

/// Who the platform emails about a posted review.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Notify {
    #[default]
    All,
    Nobody,
}

#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Open changes of `project` matching `query`. Vote histories are left
    /// empty; see [`ChangeSource::get_votes`].
    async fn list_changes(&self, project: &str, query: &str)
        -> Result<Vec<ChangeInfo>, SourceError>;

    async fn get_votes(&self, change_id: &ChangeId) -> Result<Vec<LabelVote>, SourceError>;

    /// Sets `label` to `value` on the given revision, with an optional
    /// review message.
    async fn post_label(
        &self,
        change_id: &ChangeId,
        revision: &str,
        label: &str,
        value: i8,
        message: Option<&str>,
        notify: Notify,
    ) -> Result<(), SourceError>;

    /// Asks the platform to merge the change onto its branch.
    async fn submit_merge(&self, change_id: &ChangeId) -> Result<(), SourceError>;

    async fn fetch_account(&self, account_id: i64) -> Result<AccountInfo, SourceError>;
}
