//! Label vote resolution.
//!
//! A label's vote history is an append-only sequence of timestamped votes.
//! The effective score ignores everything at or before the most recent -1, so
//! a change becomes eligible again once someone votes after a failed merge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CODE_REVIEW_LABEL: &str = "Code-Review";
pub const MERGE_QUEUE_LABEL: &str = "Merge-Queue";

/// Code-Review score required for a change to be queued.
pub const APPROVED_SCORE: i8 = 2;
/// Merge-Queue score that requests a merge.
pub const REQUESTED_SCORE: i8 = 1;
/// Merge-Queue score posted when an attempt fails.
pub const REJECTED_SCORE: i8 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub account_id: i64,
    pub value: i8,
    pub at: DateTime<Utc>,
}

impl Vote {
    pub fn new(account_id: i64, value: i8, at: DateTime<Utc>) -> Self {
        Self {
            account_id,
            value,
            at,
        }
    }
}

fn latest_rejection(votes: &[Vote]) -> Option<DateTime<Utc>> {
    votes
        .iter()
        .filter(|vote| vote.value == REJECTED_SCORE)
        .map(|vote| vote.at)
        .max()
}

fn live_votes(votes: &[Vote]) -> impl Iterator<Item = &Vote> {
    let cutoff = latest_rejection(votes);
    votes
        .iter()
        .filter(move |vote| cutoff.map_or(true, |cutoff| vote.at > cutoff))
}

/// Effective score of one label.
///
/// With no votes the score is 0. When the latest -1 has nothing newer than it
/// the score stays -1.
pub fn resolve_score(votes: &[Vote]) -> i8 {
    if votes.is_empty() {
        return 0;
    }
    match live_votes(votes).map(|vote| vote.value).max() {
        Some(score) => score,
        None => REJECTED_SCORE,
    }
}

/// When the current request was made: the earliest vote newer than the latest
/// -1 that carries the resolved score. `None` unless the score is positive.
pub fn request_time(votes: &[Vote]) -> Option<DateTime<Utc>> {
    let score = resolve_score(votes);
    if score <= 0 {
        return None;
    }
    live_votes(votes)
        .filter(|vote| vote.value == score)
        .map(|vote| vote.at)
        .min()
}

#[cfg(test)]
mod tests {
    use super::{request_time, resolve_score, Vote};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn vote_after_rejection_wins() {
        let votes = vec![Vote::new(1, 2, at(1)), Vote::new(2, -1, at(2)), Vote::new(3, 1, at(3))];
        assert_eq!(resolve_score(&votes), 1);
    }

    #[test]
    fn without_rejection_score_is_maximum() {
        let votes = vec![Vote::new(1, 1, at(1)), Vote::new(2, 2, at(2)), Vote::new(3, 0, at(3))];
        assert_eq!(resolve_score(&votes), 2);
    }

    #[test]
    fn rejection_with_nothing_newer_stays_rejected() {
        let votes = vec![Vote::new(1, 1, at(1)), Vote::new(2, -1, at(5))];
        assert_eq!(resolve_score(&votes), -1);
        assert_eq!(request_time(&votes), None);
    }

    #[test]
    fn latest_rejection_is_used_regardless_of_input_order() {
        let votes = vec![
            Vote::new(4, 1, at(9)),
            Vote::new(2, -1, at(2)),
            Vote::new(3, -1, at(7)),
            Vote::new(1, 1, at(4)),
        ];
        assert_eq!(resolve_score(&votes), 1);
        assert_eq!(request_time(&votes), Some(at(9)));
    }

    #[test]
    fn empty_history_resolves_to_zero() {
        assert_eq!(resolve_score(&[]), 0);
        assert_eq!(request_time(&[]), None);
    }

    #[test]
    fn request_time_is_earliest_vote_with_resolved_score() {
        let votes = vec![
            Vote::new(1, 1, at(1)),
            Vote::new(2, -1, at(2)),
            Vote::new(3, 1, at(6)),
            Vote::new(4, 1, at(4)),
        ];
        assert_eq!(request_time(&votes), Some(at(4)));
    }
}
