use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{CancelReason, MergeStatus};
use crate::types::{ChangeId, RecordId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EventKind {
    RecordCreated {
        status: MergeStatus,
        changes: Vec<ChangeId>,
    },
    StatusChanged {
        from: MergeStatus,
        to: MergeStatus,
    },
    ChangeSubmitted {
        change_id: ChangeId,
    },
    SubmitRefused {
        change_id: ChangeId,
        message: String,
    },
    CancelRequested {
        reason: CancelReason,
    },
    LeaseReleased,
    ResultRejected {
        reported: MergeStatus,
        current: MergeStatus,
    },
    SnapshotRefreshed {
        changes: usize,
    },
    PollFailed {
        message: String,
    },
    WorkerPaused {
        worker_id: String,
        paused: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub at: DateTime<Utc>,
    /// `project/queue` or bare project for poll events.
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub rid: Option<RecordId>,
    pub kind: EventKind,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            at: Utc::now(),
            scope: None,
            rid: None,
            kind,
        }
    }

    pub fn scoped(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn for_record(mut self, rid: RecordId) -> Self {
        self.rid = Some(rid);
        self
    }

    pub fn kind_tag(&self) -> &'static str {
        match self.kind {
            EventKind::RecordCreated { .. } => "record_created",
            EventKind::StatusChanged { .. } => "status_changed",
            EventKind::ChangeSubmitted { .. } => "change_submitted",
            EventKind::SubmitRefused { .. } => "submit_refused",
            EventKind::CancelRequested { .. } => "cancel_requested",
            EventKind::LeaseReleased => "lease_released",
            EventKind::ResultRejected { .. } => "result_rejected",
            EventKind::SnapshotRefreshed { .. } => "snapshot_refreshed",
            EventKind::PollFailed { .. } => "poll_failed",
            EventKind::WorkerPaused { .. } => "worker_paused",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, EventKind};
    use crate::state::MergeStatus;
    use crate::types::RecordId;

    #[test]
    fn event_kind_serializes_with_snake_case_tag() {
        let event = Event::new(EventKind::StatusChanged {
            from: MergeStatus::InProgress,
            to: MergeStatus::StepFailed,
        })
        .scoped("infra/main")
        .for_record(RecordId(3));

        let encoded = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(encoded["kind"]["type"], "status_changed");
        assert_eq!(encoded["kind"]["to"], -1);
        assert_eq!(encoded["rid"], 3);
        assert_eq!(event.kind_tag(), "status_changed");

        let decoded: Event = serde_json::from_value(encoded).expect("deserialize event");
        assert_eq!(decoded, event);
    }
}
