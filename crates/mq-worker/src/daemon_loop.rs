//! The worker loop: ask the master for a job, run it, report the result.
//!
//! A worker keeps no state between jobs. Anything it fails to report is
//! resolved by the master once the job's lease expires.

use mq_core::{DaemonConfig, Job, JobArtifacts, JobRequest, MergeStatus, RecordId, ReportOutcome, ResultReport};
use mq_exec::{run_job, ExecSettings, RunOutcome, StepPhase};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::client::{ClientError, JobClient};
use crate::ticker::Ticker;

const REPORT_ATTEMPTS: usize = 3;
const REPORT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// What one pass through the loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The offline sentinel exists; the master was not contacted.
    Offline,
    Paused,
    Idle,
    Ran {
        rid: RecordId,
        status: MergeStatus,
        /// `None` when the report never reached the master.
        outcome: Option<ReportOutcome>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub worker_id: String,
    pub request: JobRequest,
    pub exec: ExecSettings,
    pub offline_sentinel: Option<PathBuf>,
    pub poll_period: Duration,
}

impl WorkerSettings {
    pub fn from_config(daemon: &DaemonConfig) -> Self {
        Self {
            worker_id: daemon.worker_id.clone(),
            request: JobRequest {
                worker_id: daemon.worker_id.clone(),
                pid: Some(std::process::id()),
                filters: daemon.queues.clone(),
            },
            exec: ExecSettings {
                workspace_root: daemon.workspace_path.clone(),
                log_root: daemon.log_path.clone(),
                cancel_poll: Duration::from_secs(daemon.cancel_poll_secs.max(1)),
            },
            offline_sentinel: daemon.offline_sentinel_path.clone(),
            poll_period: Duration::from_secs(daemon.poll_period_secs.max(1)),
        }
    }

    fn is_offline(&self) -> bool {
        self.offline_sentinel
            .as_ref()
            .map_or(false, |path| path.exists())
    }
}

pub struct WorkerDaemon<C: JobClient> {
    client: C,
    settings: WorkerSettings,
}

impl<C: JobClient> WorkerDaemon<C> {
    pub fn new(client: C, settings: WorkerSettings) -> Self {
        Self { client, settings }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// One request/run/report cycle.
    pub fn tick(&self) -> Result<TickOutcome, ClientError> {
        if self.settings.is_offline() {
            debug!(worker = %self.settings.worker_id, "offline sentinel present");
            return Ok(TickOutcome::Offline);
        }
        let response = self.client.request_job(&self.settings.request)?;
        if response.paused {
            return Ok(TickOutcome::Paused);
        }
        let Some(job) = response.job else {
            return Ok(TickOutcome::Idle);
        };

        info!(
            rid = %job.rid,
            queue = %job.workspace_id(),
            changes = job.changes.len(),
            "starting merge job"
        );
        let RunOutcome { status, artifacts } = self.execute(&job);
        let outcome = self.report(job.rid, status, artifacts);
        Ok(TickOutcome::Ran {
            rid: job.rid,
            status,
            outcome,
        })
    }

    fn execute(&self, job: &Job) -> RunOutcome {
        let client = &self.client;
        let mut probe = |rid: RecordId, phase: StepPhase| match client.cancel_status(rid) {
            Ok(probe) => probe.reason(),
            Err(err) => {
                warn!(rid = %rid, step = phase.index + 1, error = %err, "cancel probe failed");
                None
            }
        };
        match run_job(job, &self.settings.exec, &mut probe) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(rid = %job.rid, error = %err, "merge job could not run");
                let mut artifacts = JobArtifacts::default();
                artifacts.note(format!("worker error: {err}"));
                RunOutcome {
                    status: MergeStatus::StepFailed,
                    artifacts,
                }
            }
        }
    }

    fn report(&self, rid: RecordId, status: MergeStatus, artifacts: JobArtifacts) -> Option<ReportOutcome> {
        let report = ResultReport {
            worker_id: self.settings.worker_id.clone(),
            status,
            artifacts,
        };
        for attempt in 1..=REPORT_ATTEMPTS {
            match self.client.report_result(rid, &report) {
                Ok(outcome) => {
                    match &outcome {
                        ReportOutcome::Accepted { .. } => info!(rid = %rid, %status, "result accepted"),
                        ReportOutcome::Rejected { current } => {
                            warn!(rid = %rid, %status, current = %current, "result rejected by master")
                        }
                    }
                    return Some(outcome);
                }
                Err(err) if attempt < REPORT_ATTEMPTS => {
                    warn!(rid = %rid, attempt, error = %err, "result report failed, retrying");
                    thread::sleep(REPORT_RETRY_DELAY);
                }
                Err(err) => {
                    error!(rid = %rid, error = %err, "giving up on result report");
                }
            }
        }
        None
    }

    /// Runs ticks until `shutdown` is raised. A job in progress is always
    /// finished and reported first.
    pub fn run(&self, shutdown: &AtomicBool) {
        let mut ticker = Ticker::new(self.settings.poll_period);
        info!(
            worker = %self.settings.worker_id,
            queues = self.settings.request.filters.len(),
            period_secs = ticker.period().as_secs(),
            "worker started"
        );
        while ticker.wait(shutdown) {
            match self.tick() {
                Ok(TickOutcome::Ran { .. }) | Ok(TickOutcome::Idle) | Ok(TickOutcome::Offline) => {}
                Ok(TickOutcome::Paused) => debug!(worker = %self.settings.worker_id, "paused by master"),
                Err(err) => warn!(worker = %self.settings.worker_id, error = %err, "job request failed"),
            }
        }
        info!(worker = %self.settings.worker_id, "worker stopped");
    }
}
