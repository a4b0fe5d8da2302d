use mq_core::{CancelReason, JobArtifacts, MergeStatus, RecordId};
use std::path::PathBuf;
use std::time::Duration;

/// Where a worker keeps queue workspaces and build logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSettings {
    pub workspace_root: PathBuf,
    pub log_root: PathBuf,
    /// How often a running step asks whether it should be canceled.
    pub cancel_poll: Duration,
}

/// Position of a step within its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPhase {
    pub index: usize,
    pub total: usize,
    /// True while the step is running, false at the boundary before it.
    pub running: bool,
}

impl StepPhase {
    pub fn is_last(&self) -> bool {
        self.index + 1 == self.total
    }
}

/// Asked between steps and periodically while a step runs.
pub trait CancelCheck {
    fn cancel_requested(&mut self, rid: RecordId, phase: StepPhase) -> Option<CancelReason>;
}

/// Never cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCancel;

impl CancelCheck for NoCancel {
    fn cancel_requested(&mut self, _rid: RecordId, _phase: StepPhase) -> Option<CancelReason> {
        None
    }
}

impl<F> CancelCheck for F
where
    F: FnMut(RecordId, StepPhase) -> Option<CancelReason>,
{
    fn cancel_requested(&mut self, rid: RecordId, phase: StepPhase) -> Option<CancelReason> {
        self(rid, phase)
    }
}

/// Terminal status of a run plus everything attributed to the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: MergeStatus,
    pub artifacts: JobArtifacts,
}
