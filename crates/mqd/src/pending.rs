//! Pending-list derivation.
//!
//! Pending lists are rebuilt from the latest snapshot on every call; nothing
//! is carried over between derivations except the request times recorded on
//! the changes themselves.

use mq_core::{
    ChangeId, ChangeInfo, MasterConfig, MergeRecord, MergeStatus, QueueDef, QueueKey,
    APPROVED_SCORE, REQUESTED_SCORE,
};
use std::collections::HashMap;

/// Label names consulted for eligibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibilityRules {
    pub review_label: String,
    pub queue_label: String,
}

impl EligibilityRules {
    pub fn from_master_config(config: &MasterConfig) -> Self {
        Self {
            review_label: config.review_label.clone(),
            queue_label: config.queue_label.clone(),
        }
    }

    pub fn is_requested(&self, change: &ChangeInfo) -> bool {
        change.label_score(&self.queue_label) == REQUESTED_SCORE
    }

    /// Open, approved and requested. Branch and project are checked by the
    /// queue.
    pub fn is_eligible(&self, change: &ChangeInfo) -> bool {
        change.status.is_open()
            && change.label_score(&self.review_label) == APPROVED_SCORE
            && self.is_requested(change)
    }
}

impl Default for EligibilityRules {
    fn default() -> Self {
        Self::from_master_config(&MasterConfig::default())
    }
}

/// Records each change took part in.
#[derive(Debug, Default)]
pub struct AttemptIndex<'a> {
    by_change: HashMap<&'a ChangeId, Vec<&'a MergeRecord>>,
}

impl<'a> AttemptIndex<'a> {
    pub fn build(records: impl IntoIterator<Item = &'a MergeRecord>) -> Self {
        let mut by_change: HashMap<&'a ChangeId, Vec<&'a MergeRecord>> = HashMap::new();
        for record in records {
            for change_id in record.change_ids() {
                by_change.entry(change_id).or_default().push(record);
            }
        }
        Self { by_change }
    }

    /// True when `change` must not be dispatched again for now.
    pub fn is_attempted(&self, change: &ChangeInfo) -> bool {
        let Some(records) = self.by_change.get(&change.change_id) else {
            return false;
        };
        let requested = change.effective_request_time();
        records.iter().any(|record| {
            if !record.status.is_terminal() || record.has_landed(&change.change_id) {
                return true;
            }
            if record.submit_refused() {
                return record.ended_at.map_or(false, |ended| ended >= requested);
            }
            match record.status {
                // verified, waiting on the cascade
                MergeStatus::Success => true,
                status if status.is_failure() => record
                    .started_at
                    .map_or(false, |started| started >= requested),
                _ => false,
            }
        })
    }
}

/// First configured queue that owns `change`.
pub fn queue_for_change<'q>(queues: &'q [QueueDef], change: &ChangeInfo) -> Option<&'q QueueDef> {
    queues
        .iter()
        .find(|queue| queue.key.project == change.project && queue.matches_branch(&change.branch))
}

/// Pending list of every queue, in configuration order.
pub fn derive_pending<'c>(
    queues: &[QueueDef],
    snapshot: impl IntoIterator<Item = &'c ChangeInfo>,
    attempts: &AttemptIndex<'_>,
    rules: &EligibilityRules,
) -> Vec<(QueueKey, Vec<ChangeInfo>)> {
    let mut buckets: Vec<(QueueKey, Vec<ChangeInfo>)> = queues
        .iter()
        .map(|queue| (queue.key.clone(), Vec::new()))
        .collect();
    for change in snapshot {
        if !rules.is_eligible(change) || attempts.is_attempted(change) {
            continue;
        }
        let Some(owner) = queue_for_change(queues, change) else {
            continue;
        };
        if let Some((_, pending)) = buckets.iter_mut().find(|(key, _)| *key == owner.key) {
            pending.push(change.clone());
        }
    }
    for (_, pending) in &mut buckets {
        pending.sort_by(ChangeInfo::dispatch_cmp);
    }
    buckets
}

/// Splits an ordered pending list into batches: each batch is the leading run
/// of changes sharing the branch of its first change, at most `batch_size`
/// long.
pub fn split_batches(pending: &[ChangeInfo], batch_size: usize) -> Vec<Vec<ChangeInfo>> {
    let batch_size = batch_size.max(1);
    let mut batches: Vec<Vec<ChangeInfo>> = Vec::new();
    for change in pending {
        match batches.last_mut() {
            Some(batch) if batch.len() < batch_size && batch[0].branch == change.branch => {
                batch.push(change.clone());
            }
            _ => batches.push(vec![change.clone()]),
        }
    }
    batches
}
