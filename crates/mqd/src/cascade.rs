//! Optimistic cascade planning.
//!
//! Planning is pure: it reads the records of one queue and says what to
//! submit, what to cancel and whether the queue lease goes away. The engine
//! executes the plan, submitting in order and stopping at the first refusal.

use mq_core::{ChangeId, MergeRecord, MergeStatus, RecordId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CascadeStep {
    /// Merge the changes of a record through the review platform.
    /// `optimistic` records were never verified on their own.
    Submit {
        rid: RecordId,
        changes: Vec<ChangeId>,
        optimistic: bool,
    },
    /// The last build step already merged; only bookkeeping is left.
    MarkMerged { rid: RecordId },
}

impl CascadeStep {
    pub fn rid(&self) -> RecordId {
        match self {
            CascadeStep::Submit { rid, .. } | CascadeStep::MarkMerged { rid } => *rid,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadePlan {
    pub steps: Vec<CascadeStep>,
    /// Queued records that will never run.
    pub cancels: Vec<RecordId>,
    /// Record that stopped the cascade by failing or being canceled.
    pub halted_at: Option<RecordId>,
    pub release_lease: bool,
}

impl CascadePlan {
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty() && self.cancels.is_empty() && !self.release_lease
    }
}

/// Waiting on the cascade: not yet terminal, or verified but not merged.
pub fn is_open(record: &MergeRecord) -> bool {
    match record.status {
        MergeStatus::Queued | MergeStatus::InProgress => true,
        MergeStatus::Success => !record.is_submitted() && !record.submit_refused(),
        _ => false,
    }
}

fn unlanded_ids(record: &MergeRecord) -> Vec<ChangeId> {
    record
        .unlanded()
        .map(|change| change.change_id.clone())
        .collect()
}

/// Plans the cascade of one queue after `trigger` changed state.
///
/// `records` are the records of that queue in any order.
pub fn plan_cascade(records: &[&MergeRecord], trigger: RecordId, self_merging: bool) -> CascadePlan {
    let mut ordered: Vec<&MergeRecord> = records.to_vec();
    ordered.sort_by_key(|record| record.rid);

    let start = ordered
        .iter()
        .filter(|record| is_open(record))
        .map(|record| record.rid)
        .chain(std::iter::once(trigger))
        .min()
        .unwrap_or(trigger);

    let mut plan = CascadePlan::default();
    let window: Vec<&MergeRecord> = ordered.into_iter().filter(|record| record.rid >= start).collect();

    for (position, record) in window.iter().enumerate() {
        match record.status {
            MergeStatus::Success if record.is_submitted() => {}
            MergeStatus::Success if !record.submit_refused() => plan.steps.push(if self_merging {
                CascadeStep::MarkMerged { rid: record.rid }
            } else {
                CascadeStep::Submit {
                    rid: record.rid,
                    changes: unlanded_ids(record),
                    optimistic: false,
                }
            }),
            MergeStatus::Queued if record.cancel.is_none() => plan.steps.push(CascadeStep::Submit {
                rid: record.rid,
                changes: unlanded_ids(record),
                optimistic: true,
            }),
            MergeStatus::InProgress => return plan,
            // a failed record, a refused merge, or a queued one somebody
            // asked to cancel
            _ => {
                plan.halted_at = Some(record.rid);
                plan.cancels = window[position..]
                    .iter()
                    .filter(|later| later.status == MergeStatus::Queued)
                    .map(|later| later.rid)
                    .collect();
                plan.release_lease = true;
                return plan;
            }
        }
    }
    plan.release_lease = true;
    plan
}

/// Queued records behind `rid`, which a refused submit of `rid` cancels.
pub fn queued_behind(records: &[&MergeRecord], rid: RecordId) -> Vec<RecordId> {
    let mut behind: Vec<RecordId> = records
        .iter()
        .filter(|record| record.rid > rid && record.status == MergeStatus::Queued)
        .map(|record| record.rid)
        .collect();
    behind.sort();
    behind
}
