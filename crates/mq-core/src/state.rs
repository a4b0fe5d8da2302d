//! Merge-attempt state machine.
//!
//! Status codes are part of the wire contract with workers and dashboards and
//! serialize as bare integers.

use serde::{Deserialize, Serialize};

/// Status of a single merge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum MergeStatus {
    /// Worker ran out of time, or its lease expired on the master.
    Timeout,
    /// Canceled by request, by a vote withdrawal, or by a failure ahead of it.
    Canceled,
    /// A build step exited non-zero, or the merge itself was refused.
    StepFailed,
    Success,
    InProgress,
    /// Dispatched behind the in-progress head, waiting on its outcome.
    Queued,
}

impl MergeStatus {
    pub const ALL: [MergeStatus; 6] = [
        MergeStatus::Timeout,
        MergeStatus::Canceled,
        MergeStatus::StepFailed,
        MergeStatus::Success,
        MergeStatus::InProgress,
        MergeStatus::Queued,
    ];

    pub fn code(self) -> i8 {
        match self {
            MergeStatus::Timeout => -3,
            MergeStatus::Canceled => -2,
            MergeStatus::StepFailed => -1,
            MergeStatus::Success => 0,
            MergeStatus::InProgress => 1,
            MergeStatus::Queued => 2,
        }
    }

    pub fn from_code(code: i8) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MergeStatus::Timeout => "TIMEOUT",
            MergeStatus::Canceled => "CANCELED",
            MergeStatus::StepFailed => "STEP_FAILED",
            MergeStatus::Success => "SUCCESS",
            MergeStatus::InProgress => "IN_PROGRESS",
            MergeStatus::Queued => "QUEUED",
        }
    }

    /// Returns true once no worker report can change the status anymore.
    pub fn is_terminal(self) -> bool {
        !matches!(self, MergeStatus::InProgress | MergeStatus::Queued)
    }

    /// Returns true for terminal outcomes that did not verify.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            MergeStatus::Timeout | MergeStatus::Canceled | MergeStatus::StepFailed
        )
    }

    /// Statuses a worker may report for its job.
    pub fn is_reportable(self) -> bool {
        self.is_terminal()
    }
}

impl From<MergeStatus> for i8 {
    fn from(status: MergeStatus) -> Self {
        status.code()
    }
}

impl TryFrom<i8> for MergeStatus {
    type Error = String;

    fn try_from(code: i8) -> Result<Self, Self::Error> {
        MergeStatus::from_code(code).ok_or_else(|| format!("unknown merge status code {code}"))
    }
}

impl std::str::FromStr for MergeStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "invalid merge status '{value}'. valid values: TIMEOUT, CANCELED, STEP_FAILED, SUCCESS, IN_PROGRESS, QUEUED"
                )
            })
    }
}

impl std::fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid merge status transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: MergeStatus,
    pub to: MergeStatus,
}

/// Allowed edges of the merge-attempt state machine. Terminal states have no
/// outgoing edges.
pub fn is_transition_allowed(from: MergeStatus, to: MergeStatus) -> bool {
    use MergeStatus::*;
    matches!(
        (from, to),
        (Queued, InProgress)
            | (Queued, Success)
            | (Queued, StepFailed)
            | (Queued, Canceled)
            | (InProgress, Success)
            | (InProgress, StepFailed)
            | (InProgress, Canceled)
            | (InProgress, Timeout)
    )
}

pub fn transition_status(from: MergeStatus, to: MergeStatus) -> Result<MergeStatus, InvalidTransition> {
    if is_transition_allowed(from, to) {
        Ok(to)
    } else {
        Err(InvalidTransition { from, to })
    }
}

/// Why a cancellation was requested for a running record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The queue label no longer resolves to +1 on one of the changes.
    VoteWithdrawn,
    /// Someone asked for it through the service surface.
    Explicit,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CancelReason::VoteWithdrawn => "vote_withdrawn",
            CancelReason::Explicit => "explicit",
        }
    }
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
