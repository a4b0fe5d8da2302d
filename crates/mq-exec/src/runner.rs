//! Runs the build steps of one merge record.

use chrono::Utc;
use mq_core::{CancelReason, Job, JobArtifacts, MergeStatus, StepReport};
use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::command::{build_env, kill_process_group, render_command, spawn_step};
use crate::error::ExecError;
use crate::types::{CancelCheck, ExecSettings, RunOutcome, StepPhase};
use crate::workspace::{append_line, open_append, prepare_workspace, read_tail, RecordLogs};

const WAIT_TICK: Duration = Duration::from_millis(50);
const OUTPUT_TAIL_BYTES: u64 = 16 * 1024;
const FAILED_STDERR_TAIL_BYTES: u64 = 4 * 1024;

enum StepEnd {
    Exited(Option<i32>),
    Canceled(CancelReason),
    DeadlineExceeded,
}

/// Variables describing the batch, added on top of the queue environment.
pub fn batch_env(job: &Job) -> Vec<(String, String)> {
    let join = |f: fn(&mq_core::JobChange) -> String| {
        job.changes.iter().map(f).collect::<Vec<_>>().join(" ")
    };
    vec![
        ("MQ_MERGE_ID".to_string(), job.rid.to_string()),
        ("MQ_PROJECT".to_string(), job.project.clone()),
        ("MQ_QUEUE".to_string(), job.queue_name.clone()),
        ("MQ_BRANCH".to_string(), job.branch.clone()),
        ("MQ_CHANGES".to_string(), join(|c| c.change_id.to_string())),
        ("MQ_REVISIONS".to_string(), join(|c| c.revision.clone())),
    ]
}

/// A self-merging queue's last step may clear the queue vote itself.
fn ignores_cancel(job: &Job, phase: StepPhase, reason: CancelReason) -> bool {
    job.self_merging && phase.running && phase.is_last() && reason == CancelReason::VoteWithdrawn
}

fn wait_step(
    child: &mut Child,
    job: &Job,
    phase: StepPhase,
    settings: &ExecSettings,
    cancel: &mut dyn CancelCheck,
    command: &str,
) -> Result<StepEnd, ExecError> {
    let wait_err = |source| ExecError::Wait {
        command: command.to_string(),
        source,
    };
    let mut last_probe = Instant::now();
    loop {
        if let Some(status) = child.try_wait().map_err(wait_err)? {
            return Ok(StepEnd::Exited(status.code()));
        }
        if Utc::now() >= job.deadline {
            kill_process_group(child).map_err(wait_err)?;
            return Ok(StepEnd::DeadlineExceeded);
        }
        if last_probe.elapsed() >= settings.cancel_poll {
            last_probe = Instant::now();
            if let Some(reason) = cancel.cancel_requested(job.rid, phase) {
                if ignores_cancel(job, phase, reason) {
                    debug!(rid = %job.rid, "ignoring vote withdrawal during merging step");
                } else {
                    kill_process_group(child).map_err(wait_err)?;
                    return Ok(StepEnd::Canceled(reason));
                }
            }
        }
        thread::sleep(WAIT_TICK);
    }
}

/// Runs every step of `job` in order inside its queue workspace, stopping at
/// the first non-zero exit, a cancel request, or the job deadline.
///
/// Step failures are part of the outcome; `Err` is reserved for problems
/// with the worker's own workspace or log files.
pub fn run_job(
    job: &Job,
    settings: &ExecSettings,
    cancel: &mut dyn CancelCheck,
) -> Result<RunOutcome, ExecError> {
    let workspace = prepare_workspace(&settings.workspace_root, job)?;
    let logs = RecordLogs::create(&settings.log_root, job.rid)?;
    let env = build_env(&job.env, job.merge_build_env, &batch_env(job));
    let mut artifacts = JobArtifacts {
        logs: logs.refs(),
        ..JobArtifacts::default()
    };

    append_line(
        &logs.log,
        &format!(
            "[{}] merge {} for {} on {} with {} change(s) in {}",
            Utc::now().to_rfc3339(),
            job.rid,
            job.workspace_id(),
            job.branch,
            job.changes.len(),
            workspace.display()
        ),
    )?;

    let total = job.steps.len();
    let mut status = MergeStatus::Success;
    for (index, argv) in job.steps.iter().enumerate() {
        let boundary = StepPhase {
            index,
            total,
            running: false,
        };
        if Utc::now() >= job.deadline {
            status = MergeStatus::Timeout;
            artifacts.note(format!("deadline passed before step {}", index + 1));
            break;
        }
        if let Some(reason) = cancel.cancel_requested(job.rid, boundary) {
            status = MergeStatus::Canceled;
            artifacts.note(format!("canceled before step {} ({reason})", index + 1));
            break;
        }

        let command = render_command(argv);
        let header = format!("======== step {}/{}: {} ========", index + 1, total, command);
        append_line(&logs.stdout, &header)?;
        append_line(&logs.stderr, &header)?;
        append_line(&logs.log, &format!("[{}] {header}", Utc::now().to_rfc3339()))?;
        info!(rid = %job.rid, step = index + 1, total, %command, "running build step");

        let started = Instant::now();
        let spawned = if argv.is_empty() {
            Err(ExecError::EmptyStep { index })
        } else {
            spawn_step(
                argv,
                &workspace,
                &env,
                open_append(&logs.stdout)?,
                open_append(&logs.stderr)?,
            )
        };
        let end = match spawned {
            Ok(mut child) => {
                let phase = StepPhase {
                    running: true,
                    ..boundary
                };
                wait_step(&mut child, job, phase, settings, cancel, &command)?
            }
            Err(err) => {
                warn!(rid = %job.rid, error = %err, "build step did not start");
                artifacts.note(err.to_string());
                StepEnd::Exited(None)
            }
        };
        let exit_code = match &end {
            StepEnd::Exited(code) => *code,
            _ => None,
        };
        artifacts.steps.push(StepReport {
            index,
            argv: argv.clone(),
            exit_code,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        });

        match end {
            StepEnd::Exited(Some(0)) => {
                append_line(&logs.log, &format!("step {} succeeded", index + 1))?;
            }
            StepEnd::Exited(code) => {
                status = MergeStatus::StepFailed;
                let code = code.map_or_else(|| "none".to_string(), |c| c.to_string());
                append_line(
                    &logs.log,
                    &format!(
                        "******** step {}/{} failed: {} (return code {}) ********",
                        index + 1,
                        total,
                        command,
                        code
                    ),
                )?;
                append_line(&logs.log, read_tail(&logs.stderr, FAILED_STDERR_TAIL_BYTES).trim_end())?;
                artifacts.note(format!("step {} failed with return code {code}", index + 1));
                break;
            }
            StepEnd::Canceled(reason) => {
                status = MergeStatus::Canceled;
                append_line(&logs.log, &format!("step {} killed: cancel requested ({reason})", index + 1))?;
                artifacts.note(format!("canceled during step {} ({reason})", index + 1));
                break;
            }
            StepEnd::DeadlineExceeded => {
                status = MergeStatus::Timeout;
                append_line(&logs.log, &format!("step {} killed: job deadline passed", index + 1))?;
                artifacts.note(format!("deadline passed during step {}", index + 1));
                break;
            }
        }
    }

    append_line(
        &logs.log,
        &format!("[{}] finished with {status}", Utc::now().to_rfc3339()),
    )?;
    artifacts.output = read_tail(&logs.log, OUTPUT_TAIL_BYTES);
    info!(rid = %job.rid, %status, steps = artifacts.steps.len(), "merge job finished");
    Ok(RunOutcome { status, artifacts })
}
