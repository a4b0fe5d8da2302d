//! The master's queue engine.
//!
//! All queue, lease and record state lives in one [`EngineState`] behind a
//! mutex. Every decision is taken under that lock from in-memory state; the
//! lock is never held across review-platform calls. Records and events are
//! written through to the sqlite store as they change.

use chrono::{DateTime, Duration, Utc};
use mq_core::{
    compile_queues, CancelProbe, CancelReason, CancelRequest, ChangeId, ChangeInfo, ConfigError,
    Event, EventKind, HistoryPage, InvalidTransition, Job, JobChange, JobRequest, JobResponse,
    MasterConfig, MergeRecord, MergeStatus, MqConfig, Page, PageRequest, QueueDef, QueueEntry,
    QueueKey, QueuePage, RecordId, ReportOutcome, ResultReport, ScopeFilter, StatusReport,
    REJECTED_SCORE, REQUESTED_SCORE,
};
use mq_source::{ChangeSource, Notify};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cascade::{is_open, plan_cascade, queued_behind, CascadeStep};
use crate::lease::{LeaseHeld, LeaseTable, WorkerLease};
use crate::pending::{derive_pending, split_batches, AttemptIndex, EligibilityRules};
use crate::persistence::{PersistenceError, SqliteStore};
use crate::workers::{WorkerInfo, WorkerRegistry};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const OPTIMISTIC_NOTE: &str = "merged behind a verified record without its own build";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error(transparent)]
    Lease(#[from] LeaseHeld),
    #[error("merge record not found: {rid}")]
    UnknownRecord { rid: RecordId },
    #[error("status {status} cannot be reported for a job")]
    UnreportableStatus { status: MergeStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CancelOutcome {
    Requested { cancel: CancelRequest },
    AlreadyTerminal { current: MergeStatus },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotUpdate {
    pub changes: usize,
    /// Records flagged because a change lost its queue vote.
    pub withdrawn: Vec<RecordId>,
}

fn needs_writeback(record: &MergeRecord) -> bool {
    match record.status {
        MergeStatus::StepFailed | MergeStatus::Timeout => true,
        MergeStatus::Canceled => record.was_started(),
        _ => false,
    }
}

#[derive(Debug)]
struct EngineState {
    store: SqliteStore,
    snapshot: BTreeMap<ChangeId, ChangeInfo>,
    records: BTreeMap<RecordId, MergeRecord>,
    leases: LeaseTable,
    workers: WorkerRegistry,
    next_rid: RecordId,
    events: broadcast::Sender<Event>,
}

impl EngineState {
    fn emit(&self, event: Event) {
        if let Err(err) = self.store.append_event(&event) {
            warn!(error = %err, kind = event.kind_tag(), "failed to persist engine event");
        }
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn allocate_rid(&mut self) -> RecordId {
        let rid = self.next_rid;
        self.next_rid = rid.next();
        rid
    }

    fn queue_records(&self, key: &QueueKey) -> Vec<&MergeRecord> {
        self.records
            .values()
            .filter(|record| record.project == key.project && record.queue_name == key.name)
            .collect()
    }

    fn insert_record(&mut self, record: MergeRecord) -> Result<(), EngineError> {
        self.store.upsert_record(&record)?;
        self.emit(
            Event::new(EventKind::RecordCreated {
                status: record.status,
                changes: record.change_ids().cloned().collect(),
            })
            .scoped(record.workspace_id())
            .for_record(record.rid),
        );
        self.records.insert(record.rid, record);
        Ok(())
    }

    /// Applies `update` to a copy of the record and keeps the copy once it
    /// is stored.
    fn update_record(
        &mut self,
        rid: RecordId,
        update: impl FnOnce(&mut MergeRecord),
    ) -> Result<MergeRecord, EngineError> {
        let mut record = self
            .records
            .get(&rid)
            .cloned()
            .ok_or(EngineError::UnknownRecord { rid })?;
        update(&mut record);
        self.store.upsert_record(&record)?;
        self.records.insert(rid, record.clone());
        Ok(record)
    }

    /// Moves a record along the state machine, persists it and emits the
    /// change. Returns the updated record.
    fn move_record(
        &mut self,
        rid: RecordId,
        to: MergeStatus,
        now: DateTime<Utc>,
        note: Option<String>,
    ) -> Result<MergeRecord, EngineError> {
        let from = self
            .records
            .get(&rid)
            .map(|record| record.status)
            .ok_or(EngineError::UnknownRecord { rid })?;
        let to = mq_core::transition_status(from, to)?;
        let updated = self.update_record(rid, |record| {
            record.status = to;
            if to.is_terminal() && record.ended_at.is_none() {
                record.ended_at = Some(now);
            }
            if let Some(note) = note {
                record.artifacts.note(note);
            }
        })?;
        self.emit(
            Event::new(EventKind::StatusChanged { from, to })
                .scoped(updated.workspace_id())
                .for_record(rid),
        );
        Ok(updated)
    }

    fn mark_submitted(&mut self, rid: RecordId, optimistic: bool) -> Result<MergeRecord, EngineError> {
        let now = Utc::now();
        let status = self
            .records
            .get(&rid)
            .map(|record| record.status)
            .ok_or(EngineError::UnknownRecord { rid })?;
        if status == MergeStatus::Queued {
            let note = optimistic.then(|| OPTIMISTIC_NOTE.to_string());
            self.move_record(rid, MergeStatus::Success, now, note)?;
        }
        let updated = self.update_record(rid, |record| record.submitted_at = Some(now))?;
        info!(rid = %rid, queue = %updated.workspace_id(), optimistic, "merge record submitted");
        Ok(updated)
    }

    fn mark_landed(&mut self, rid: RecordId, change_id: &ChangeId) -> Result<(), EngineError> {
        let updated = self.update_record(rid, |record| record.landed.push(change_id.clone()))?;
        self.emit(
            Event::new(EventKind::ChangeSubmitted {
                change_id: change_id.clone(),
            })
            .scoped(updated.workspace_id())
            .for_record(rid),
        );
        Ok(())
    }

    fn release_lease(&mut self, key: &QueueKey) {
        if let Some(lease) = self.leases.release(key) {
            debug!(queue = %key, rid = %lease.rid, "lease released");
            self.emit(
                Event::new(EventKind::LeaseReleased)
                    .scoped(key.to_string())
                    .for_record(lease.rid),
            );
        }
    }

    fn set_cancel(&mut self, rid: RecordId, cancel: CancelRequest) -> Result<(), EngineError> {
        let updated = self.update_record(rid, |record| record.cancel = Some(cancel.clone()))?;
        self.emit(
            Event::new(EventKind::CancelRequested {
                reason: cancel.reason,
            })
            .scoped(updated.workspace_id())
            .for_record(rid),
        );
        Ok(())
    }
}

/// A queue-label vote and message posted on the changes of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Review {
    rid: RecordId,
    targets: Vec<(ChangeId, String)>,
    value: i8,
    message: String,
    notify: Notify,
}

fn review_targets<'a>(changes: impl Iterator<Item = &'a ChangeInfo>) -> Vec<(ChangeId, String)> {
    changes
        .map(|change| (change.change_id.clone(), change.current_revision.clone()))
        .collect()
}

fn record_link(webfront: Option<&str>, rid: RecordId) -> String {
    match webfront {
        Some(url) => format!(" Details: {}/history/{rid}", url.trim_end_matches('/')),
        None => String::new(),
    }
}

impl Review {
    /// Resets the queue vote quietly while the record runs.
    fn started(record: &MergeRecord, webfront: Option<&str>) -> Self {
        Self {
            rid: record.rid,
            targets: review_targets(record.changes.iter()),
            value: 0,
            message: format!(
                "Merge attempt {} started.{}",
                record.rid,
                record_link(webfront, record.rid)
            ),
            notify: Notify::Nobody,
        }
    }

    /// The platform already mails about the merge itself.
    fn merged(record: &MergeRecord, webfront: Option<&str>) -> Self {
        Self {
            rid: record.rid,
            targets: review_targets(record.changes.iter()),
            value: REQUESTED_SCORE,
            message: format!(
                "Merge attempt {} merged.{}",
                record.rid,
                record_link(webfront, record.rid)
            ),
            notify: Notify::Nobody,
        }
    }

    /// Rejects the changes of the record that did not land.
    fn failed(record: &MergeRecord, webfront: Option<&str>) -> Self {
        let outcome = match &record.submit_error {
            Some(error) => format!("passed but the merge was refused ({error})"),
            None => format!("finished with {}", record.status),
        };
        Self {
            rid: record.rid,
            targets: review_targets(record.unlanded()),
            value: REJECTED_SCORE,
            message: format!(
                "Merge attempt {} {outcome}.{}",
                record.rid,
                record_link(webfront, record.rid)
            ),
            notify: Notify::All,
        }
    }
}

/// Posts every review. Failures are logged and otherwise ignored.
async fn post_reviews(source: Arc<dyn ChangeSource>, label: String, reviews: Vec<Review>) {
    for review in reviews {
        for (change_id, revision) in &review.targets {
            if let Err(err) = source
                .post_label(
                    change_id,
                    revision,
                    &label,
                    review.value,
                    Some(&review.message),
                    review.notify,
                )
                .await
            {
                warn!(
                    rid = %review.rid,
                    change = %change_id,
                    error = %err,
                    "failed to post review on the review platform"
                );
            }
        }
    }
}

pub struct MergeQueueEngine {
    master: MasterConfig,
    queues: Vec<QueueDef>,
    rules: EligibilityRules,
    source: Arc<dyn ChangeSource>,
    state: Mutex<EngineState>,
    events: broadcast::Sender<Event>,
}

impl MergeQueueEngine {
    pub fn from_config(
        config: &MqConfig,
        source: Arc<dyn ChangeSource>,
        store: SqliteStore,
    ) -> Result<Self, EngineError> {
        let queues = compile_queues(&config.queues)?;
        Self::open(config.master.clone(), queues, source, store)
    }

    /// Loads records and the last snapshot from `store` and cancels every
    /// record a previous master left unfinished.
    pub fn open(
        master: MasterConfig,
        queues: Vec<QueueDef>,
        source: Arc<dyn ChangeSource>,
        store: SqliteStore,
    ) -> Result<Self, EngineError> {
        Self::load(master, queues, source, store, true)
    }

    /// Like [`MergeQueueEngine::open`] but leaves unfinished records alone,
    /// for admin commands run next to a live master.
    pub fn open_for_admin(
        config: &MqConfig,
        source: Arc<dyn ChangeSource>,
        store: SqliteStore,
    ) -> Result<Self, EngineError> {
        let queues = compile_queues(&config.queues)?;
        Self::load(config.master.clone(), queues, source, store, false)
    }

    fn load(
        master: MasterConfig,
        queues: Vec<QueueDef>,
        source: Arc<dyn ChangeSource>,
        store: SqliteStore,
        recover: bool,
    ) -> Result<Self, EngineError> {
        store.migrate()?;
        let records: BTreeMap<RecordId, MergeRecord> = store
            .list_records()?
            .into_iter()
            .map(|record| (record.rid, record))
            .collect();
        let snapshot: BTreeMap<ChangeId, ChangeInfo> = store
            .list_changes(None)?
            .into_iter()
            .map(|change| (change.change_id.clone(), change))
            .collect();
        let next_rid = store.max_record_id()?.map_or(RecordId(1), RecordId::next);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let mut state = EngineState {
            store,
            snapshot,
            records,
            leases: LeaseTable::new(),
            workers: WorkerRegistry::new(),
            next_rid,
            events: events.clone(),
        };

        let now = Utc::now();
        let unfinished: Vec<(RecordId, MergeStatus)> = state
            .records
            .values()
            .filter(|record| recover && !record.status.is_terminal())
            .map(|record| (record.rid, record.status))
            .collect();
        for (rid, status) in unfinished {
            state.move_record(
                rid,
                MergeStatus::Canceled,
                now,
                Some(format!("canceled: master restarted while the record was {status}")),
            )?;
            warn!(rid = %rid, previous = %status, "canceled record left unfinished by a previous master");
        }

        info!(
            queues = queues.len(),
            records = state.records.len(),
            changes = state.snapshot.len(),
            next_rid = %state.next_rid,
            "queue engine ready"
        );

        Ok(Self {
            rules: EligibilityRules::from_master_config(&master),
            master,
            queues,
            source,
            state: Mutex::new(state),
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: Event) {
        self.lock().emit(event);
    }

    pub fn master(&self) -> &MasterConfig {
        &self.master
    }

    pub fn queues(&self) -> &[QueueDef] {
        &self.queues
    }

    pub fn source(&self) -> Arc<dyn ChangeSource> {
        Arc::clone(&self.source)
    }

    /// Distinct configured projects, in configuration order.
    pub fn projects(&self) -> Vec<String> {
        let mut projects: Vec<String> = Vec::new();
        for queue in &self.queues {
            if !projects.contains(&queue.key.project) {
                projects.push(queue.key.project.clone());
            }
        }
        projects
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    fn webfront(&self) -> Option<&str> {
        self.master.webfront_url.as_deref()
    }

    fn queue_def(&self, key: &QueueKey) -> Option<&QueueDef> {
        self.queues.iter().find(|queue| &queue.key == key)
    }

    fn job_for(&self, queue: &QueueDef, record: &MergeRecord, deadline: DateTime<Utc>) -> Job {
        Job {
            rid: record.rid,
            project: record.project.clone(),
            queue_name: record.queue_name.clone(),
            branch: record.branch.clone(),
            changes: record.changes.iter().map(JobChange::from).collect(),
            steps: queue.spec.build_steps.clone(),
            env: queue.spec.build_env.clone(),
            merge_build_env: queue.spec.merge_build_env,
            workdir: queue.spec.workdir.clone(),
            self_merging: queue.self_merging(),
            deadline,
        }
    }

    /// Hands the head batch of the first matching free queue to the worker.
    ///
    /// Expired leases are reaped first. For queues that merge through the
    /// review platform the remaining pending batches are queued behind the
    /// head as an optimistic train.
    pub async fn request_job(&self, request: JobRequest) -> Result<JobResponse, EngineError> {
        let now = Utc::now();
        let (_, writebacks) = self.reap_at(now).await?;
        self.spawn_write_back(writebacks);

        let mut state = self.lock();
        if state.workers.touch(&request.worker_id, request.pid, now) {
            debug!(worker = %request.worker_id, "worker is paused, no job handed out");
            return Ok(JobResponse {
                job: None,
                paused: true,
            });
        }

        let pending = {
            let attempts = AttemptIndex::build(state.records.values());
            derive_pending(&self.queues, state.snapshot.values(), &attempts, &self.rules)
        };

        for (queue, (key, changes)) in self.queues.iter().zip(pending) {
            if changes.is_empty()
                || !request.filters.iter().any(|filter| queue.matches_filter(filter))
                || state.leases.is_held(&key)
                || state.queue_records(&key).into_iter().any(is_open)
            {
                continue;
            }

            let mut batches = split_batches(&changes, queue.spec.batch_size()).into_iter();
            let Some(head) = batches.next() else {
                continue;
            };
            let deadline = now + Duration::seconds(self.master.max_job_duration_secs as i64);
            let rid = state.allocate_rid();
            let branch = head
                .first()
                .map(|change| change.branch.clone())
                .unwrap_or_default();
            let record = MergeRecord {
                rid,
                project: key.project.clone(),
                queue_name: key.name.clone(),
                branch,
                changes: head,
                status: MergeStatus::InProgress,
                created_at: now,
                started_at: Some(now),
                ended_at: None,
                submitted_at: None,
                landed: Vec::new(),
                submit_error: None,
                worker_id: Some(request.worker_id.clone()),
                deadline: Some(deadline),
                cancel: None,
                artifacts: Default::default(),
            };
            state.insert_record(record.clone())?;
            state.leases.acquire(
                key.clone(),
                WorkerLease {
                    rid,
                    worker_id: request.worker_id.clone(),
                    expires_at: deadline,
                },
            )?;
            info!(
                rid = %rid,
                queue = %key,
                worker = %request.worker_id,
                changes = record.changes.len(),
                "dispatched merge record"
            );

            if !queue.self_merging() {
                for batch in batches {
                    let train_rid = state.allocate_rid();
                    let branch = batch
                        .first()
                        .map(|change| change.branch.clone())
                        .unwrap_or_default();
                    state.insert_record(MergeRecord {
                        rid: train_rid,
                        project: key.project.clone(),
                        queue_name: key.name.clone(),
                        branch,
                        changes: batch,
                        status: MergeStatus::Queued,
                        created_at: now,
                        started_at: None,
                        ended_at: None,
                        submitted_at: None,
                        landed: Vec::new(),
                        submit_error: None,
                        worker_id: None,
                        deadline: None,
                        cancel: None,
                        artifacts: Default::default(),
                    })?;
                    debug!(rid = %train_rid, queue = %key, behind = %rid, "queued optimistic batch");
                }
            }

            self.spawn_write_back(vec![Review::started(&record, self.webfront())]);
            return Ok(JobResponse {
                job: Some(self.job_for(queue, &record, deadline)),
                paused: false,
            });
        }

        Ok(JobResponse {
            job: None,
            paused: false,
        })
    }

    /// Applies a worker's result and runs the cascade of its queue. Reports
    /// for records that are not running, or that come from a worker other
    /// than the one holding the record, are rejected without any change.
    pub async fn report_result(
        &self,
        rid: RecordId,
        report: ResultReport,
    ) -> Result<ReportOutcome, EngineError> {
        if !report.status.is_reportable() {
            return Err(EngineError::UnreportableStatus {
                status: report.status,
            });
        }

        let (key, mut writebacks) = {
            let mut state = self.lock();
            let record = state
                .records
                .get(&rid)
                .ok_or(EngineError::UnknownRecord { rid })?;
            if record.status != MergeStatus::InProgress {
                let current = record.status;
                warn!(
                    rid = %rid,
                    reported = %report.status,
                    current = %current,
                    worker = %report.worker_id,
                    "rejected result for a record that is not running"
                );
                state.emit(
                    Event::new(EventKind::ResultRejected {
                        reported: report.status,
                        current,
                    })
                    .for_record(rid),
                );
                return Ok(ReportOutcome::Rejected { current });
            }
            if record.worker_id.as_deref() != Some(report.worker_id.as_str()) {
                let current = record.status;
                warn!(
                    rid = %rid,
                    leased_to = record.worker_id.as_deref().unwrap_or("-"),
                    worker = %report.worker_id,
                    "rejected result from a worker that does not hold the record"
                );
                state.emit(
                    Event::new(EventKind::ResultRejected {
                        reported: report.status,
                        current,
                    })
                    .for_record(rid),
                );
                return Ok(ReportOutcome::Rejected { current });
            }
            let key = record.queue_key();

            let record = state
                .records
                .get_mut(&rid)
                .ok_or(EngineError::UnknownRecord { rid })?;
            let mut artifacts = report.artifacts;
            let mut messages = std::mem::take(&mut record.artifacts.messages);
            messages.append(&mut artifacts.messages);
            artifacts.messages = messages;
            record.artifacts = artifacts;

            let updated = state.move_record(rid, report.status, Utc::now(), None)?;
            info!(rid = %rid, queue = %key, status = %updated.status, "merge record finished");
            let writebacks = if needs_writeback(&updated) {
                vec![Review::failed(&updated, self.webfront())]
            } else {
                Vec::new()
            };
            (key, writebacks)
        };

        writebacks.extend(self.run_cascade(&key, rid).await?);
        self.write_back(writebacks).await;
        Ok(ReportOutcome::Accepted {
            status: report.status,
        })
    }

    /// Submits `changes` in order, recording each one that lands. Returns
    /// the refusal when the platform stops the merge.
    async fn submit_changes(
        &self,
        rid: RecordId,
        changes: &[ChangeId],
    ) -> Result<Option<String>, EngineError> {
        for change_id in changes {
            if let Err(err) = self.source.submit_merge(change_id).await {
                warn!(rid = %rid, change = %change_id, error = %err, "submit refused");
                let message = format!("submit of {change_id} failed: {err}");
                self.emit(
                    Event::new(EventKind::SubmitRefused {
                        change_id: change_id.clone(),
                        message: message.clone(),
                    })
                    .for_record(rid),
                );
                return Ok(Some(message));
            }
            self.lock().mark_landed(rid, change_id)?;
        }
        Ok(None)
    }

    /// Runs the cascade of one queue after `trigger` changed state. Returns
    /// the reviews still to be posted.
    ///
    /// When the cascade stops on an error the queue lease is expired, so the
    /// reaper finishes the cascade and frees the queue.
    async fn run_cascade(&self, key: &QueueKey, trigger: RecordId) -> Result<Vec<Review>, EngineError> {
        let result = self.cascade(key, trigger).await;
        if let Err(err) = &result {
            warn!(queue = %key, trigger = %trigger, error = %err, "cascade stopped early, left to the reaper");
            self.lock().leases.expire(key, Utc::now());
        }
        result
    }

    async fn cascade(&self, key: &QueueKey, trigger: RecordId) -> Result<Vec<Review>, EngineError> {
        let self_merging = self.queue_def(key).map_or(false, QueueDef::self_merging);
        let plan = {
            let state = self.lock();
            plan_cascade(&state.queue_records(key), trigger, self_merging)
        };
        if plan.is_noop() {
            return Ok(Vec::new());
        }
        debug!(queue = %key, trigger = %trigger, steps = plan.steps.len(), cancels = plan.cancels.len(), "running cascade");

        let mut reviews = Vec::new();
        for step in &plan.steps {
            let rid = step.rid();
            let optimistic = match step {
                CascadeStep::MarkMerged { .. } => false,
                CascadeStep::Submit {
                    changes,
                    optimistic,
                    ..
                } => {
                    // a cancel may have arrived while earlier steps ran
                    if *optimistic && !self.still_queued(rid) {
                        self.halt_before(key, rid)?;
                        return Ok(reviews);
                    }
                    if let Some(message) = self.submit_changes(rid, changes).await? {
                        reviews.push(self.fail_submit(key, rid, message)?);
                        return Ok(reviews);
                    }
                    *optimistic
                }
            };
            let merged = self.lock().mark_submitted(rid, optimistic)?;
            reviews.push(Review::merged(&merged, self.webfront()));
        }

        let mut state = self.lock();
        let now = Utc::now();
        for rid in &plan.cancels {
            let queued = state
                .records
                .get(rid)
                .map_or(false, |record| record.status == MergeStatus::Queued);
            if !queued {
                continue;
            }
            let note = match plan.halted_at {
                Some(halt) if halt != *rid => {
                    format!("canceled: record {halt} ahead of it did not merge")
                }
                _ => "canceled on request before it ran".to_string(),
            };
            state.move_record(*rid, MergeStatus::Canceled, now, Some(note))?;
        }
        if plan.release_lease {
            state.release_lease(key);
        }
        Ok(reviews)
    }

    fn still_queued(&self, rid: RecordId) -> bool {
        self.lock()
            .records
            .get(&rid)
            .map_or(false, |record| record.status == MergeStatus::Queued && record.cancel.is_none())
    }

    /// Stops the train in front of `rid`, a queued record canceled after the
    /// cascade was planned.
    fn halt_before(&self, key: &QueueKey, rid: RecordId) -> Result<(), EngineError> {
        let mut state = self.lock();
        let now = Utc::now();
        let queued = state
            .records
            .get(&rid)
            .map_or(false, |record| record.status == MergeStatus::Queued);
        if queued {
            state.move_record(
                rid,
                MergeStatus::Canceled,
                now,
                Some("canceled on request before it ran".to_string()),
            )?;
        }
        for behind in queued_behind(&state.queue_records(key), rid) {
            state.move_record(
                behind,
                MergeStatus::Canceled,
                now,
                Some(format!("canceled: record {rid} ahead of it did not merge")),
            )?;
        }
        state.release_lease(key);
        Ok(())
    }

    /// A refused submit stops the train. A verified record, or one that
    /// already landed some of its changes, stays SUCCESS with the refusal
    /// recorded on it; an optimistic record that landed nothing fails.
    fn fail_submit(&self, key: &QueueKey, rid: RecordId, message: String) -> Result<Review, EngineError> {
        let mut state = self.lock();
        let now = Utc::now();
        let (status, nothing_landed) = state
            .records
            .get(&rid)
            .map(|record| (record.status, record.landed.is_empty()))
            .ok_or(EngineError::UnknownRecord { rid })?;
        let refused = if status == MergeStatus::Queued && nothing_landed {
            state.move_record(rid, MergeStatus::StepFailed, now, Some(message))?
        } else {
            if status == MergeStatus::Queued {
                state.move_record(rid, MergeStatus::Success, now, Some(OPTIMISTIC_NOTE.to_string()))?;
            }
            state.update_record(rid, |record| {
                record.artifacts.note(message.clone());
                record.submit_error = Some(message);
            })?
        };
        for behind in queued_behind(&state.queue_records(key), rid) {
            state.move_record(
                behind,
                MergeStatus::Canceled,
                now,
                Some(format!("canceled: merge of record {rid} was refused")),
            )?;
        }
        state.release_lease(key);
        Ok(Review::failed(&refused, self.webfront()))
    }

    async fn reap_at(&self, now: DateTime<Utc>) -> Result<(Vec<RecordId>, Vec<Review>), EngineError> {
        let (timed_out, stranded) = {
            let mut state = self.lock();
            let mut timed_out = Vec::new();
            let mut stranded = Vec::new();
            for (key, lease) in state.leases.expired_at(now) {
                let running = state
                    .records
                    .get(&lease.rid)
                    .map_or(false, |record| record.status == MergeStatus::InProgress);
                if !running {
                    // the record ended but its cascade never finished
                    stranded.push((key, lease.rid));
                    continue;
                }
                let record = state.move_record(
                    lease.rid,
                    MergeStatus::Timeout,
                    now,
                    Some(format!(
                        "lease of worker {} expired at {}",
                        lease.worker_id,
                        lease.expires_at.to_rfc3339()
                    )),
                )?;
                warn!(rid = %lease.rid, queue = %key, worker = %lease.worker_id, "lease expired, record timed out");
                timed_out.push((key, record));
            }
            (timed_out, stranded)
        };

        let mut rids = Vec::new();
        let mut reviews = Vec::new();
        for (key, record) in timed_out {
            rids.push(record.rid);
            reviews.push(Review::failed(&record, self.webfront()));
            match self.run_cascade(&key, record.rid).await {
                Ok(more) => reviews.extend(more),
                Err(err) => warn!(queue = %key, rid = %record.rid, error = %err, "cascade after lease expiry failed"),
            }
        }
        for (key, rid) in stranded {
            match self.run_cascade(&key, rid).await {
                Ok(more) => {
                    reviews.extend(more);
                    let mut state = self.lock();
                    if state.leases.get(&key).map_or(false, |lease| lease.rid == rid) {
                        state.release_lease(&key);
                    }
                    info!(queue = %key, rid = %rid, "finished cascade of an ended record");
                }
                Err(err) => warn!(queue = %key, rid = %rid, error = %err, "retried cascade failed"),
            }
        }
        Ok((rids, reviews))
    }

    /// Times out every running record whose lease expired before `now` and
    /// finishes cascades left behind by ended records.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<RecordId>, EngineError> {
        let (rids, writebacks) = self.reap_at(now).await?;
        self.write_back(writebacks).await;
        Ok(rids)
    }

    /// Finishes cascades a previous master left with verified but unmerged
    /// records.
    pub async fn resume_cascades(&self) -> Result<(), EngineError> {
        let mut triggers: BTreeMap<QueueKey, RecordId> = BTreeMap::new();
        {
            let state = self.lock();
            for record in state.records.values() {
                if record.status == MergeStatus::Success
                    && !record.is_submitted()
                    && !record.submit_refused()
                {
                    triggers.entry(record.queue_key()).or_insert(record.rid);
                }
            }
        }
        for (key, rid) in triggers {
            info!(queue = %key, rid = %rid, "resuming cascade");
            let writebacks = self.run_cascade(&key, rid).await?;
            self.write_back(writebacks).await;
        }
        Ok(())
    }

    async fn write_back(&self, reviews: Vec<Review>) {
        if self.master.silent || reviews.is_empty() {
            return;
        }
        post_reviews(self.source(), self.master.queue_label.clone(), reviews).await;
    }

    /// Posts in the background so the caller never waits on the platform.
    fn spawn_write_back(&self, reviews: Vec<Review>) {
        if self.master.silent || reviews.is_empty() {
            return;
        }
        tokio::spawn(post_reviews(
            self.source(),
            self.master.queue_label.clone(),
            reviews,
        ));
    }

    /// Flags a running or queued record for cooperative cancellation.
    pub fn cancel(
        &self,
        rid: RecordId,
        requested_by: Option<String>,
    ) -> Result<CancelOutcome, EngineError> {
        let mut state = self.lock();
        let record = state
            .records
            .get(&rid)
            .ok_or(EngineError::UnknownRecord { rid })?;
        if record.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal {
                current: record.status,
            });
        }
        if let Some(existing) = &record.cancel {
            return Ok(CancelOutcome::Requested {
                cancel: existing.clone(),
            });
        }
        let cancel = CancelRequest {
            reason: CancelReason::Explicit,
            requested_by,
            at: Utc::now(),
        };
        state.set_cancel(rid, cancel.clone())?;
        info!(rid = %rid, by = cancel.requested_by.as_deref().unwrap_or("-"), "cancel requested");
        Ok(CancelOutcome::Requested { cancel })
    }

    /// What a worker running `rid` should do. Records that ended on the
    /// master side, e.g. by lease expiry, answer with a cancel too.
    pub fn cancel_status(&self, rid: RecordId) -> Result<CancelProbe, EngineError> {
        let state = self.lock();
        let record = state
            .records
            .get(&rid)
            .ok_or(EngineError::UnknownRecord { rid })?;
        let cancel = match (&record.cancel, record.status) {
            (Some(cancel), _) => Some(cancel.clone()),
            (None, MergeStatus::InProgress | MergeStatus::Queued) => None,
            (None, _) => Some(CancelRequest {
                reason: CancelReason::Explicit,
                requested_by: Some("master".to_string()),
                at: record.ended_at.unwrap_or_else(Utc::now),
            }),
        };
        Ok(CancelProbe { cancel })
    }

    /// Returns the previous pause flag.
    pub fn set_pause(&self, worker_id: &str, paused: bool) -> bool {
        let mut state = self.lock();
        let previous = state.workers.set_paused(worker_id, paused);
        state.emit(Event::new(EventKind::WorkerPaused {
            worker_id: worker_id.to_string(),
            paused,
        }));
        info!(worker = %worker_id, paused, "worker pause changed");
        previous
    }

    /// Status of one worker, or of the master itself.
    pub fn status(&self, worker_id: Option<&str>) -> StatusReport {
        match worker_id {
            Some(worker_id) => {
                let window = Duration::seconds(2 * self.master.poll_period_secs as i64);
                self.lock().workers.status(worker_id, window, Utc::now())
            }
            None => StatusReport {
                alive: true,
                paused: false,
                pid: Some(std::process::id()),
                worker_id: None,
                last_seen: None,
            },
        }
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.lock().workers.list()
    }

    /// Current pending lists, in configuration order, paged across queues.
    pub fn get_queue(&self, filter: &ScopeFilter, page: PageRequest) -> QueuePage {
        let state = self.lock();
        let attempts = AttemptIndex::build(state.records.values());
        let entries: Vec<QueueEntry> =
            derive_pending(&self.queues, state.snapshot.values(), &attempts, &self.rules)
                .into_iter()
                .flat_map(|(key, changes)| {
                    let queue = key.to_string();
                    changes
                        .into_iter()
                        .enumerate()
                        .map(move |(position, change)| QueueEntry {
                            queue: queue.clone(),
                            position,
                            change,
                        })
                })
                .filter(|entry| filter.matches(&entry.change.project, &entry.change.branch))
                .collect();
        Page {
            count: entries.len(),
            offset: page.offset,
            limit: page.limit,
            items: page.slice(&entries),
        }
    }

    pub fn get_history(
        &self,
        filter: &ScopeFilter,
        page: PageRequest,
    ) -> Result<HistoryPage, EngineError> {
        Ok(self.lock().store.history(filter, page)?)
    }

    pub fn get_record(&self, rid: RecordId) -> Option<MergeRecord> {
        self.lock().records.get(&rid).cloned()
    }

    pub fn record_events(&self, rid: RecordId) -> Result<Vec<Event>, EngineError> {
        Ok(self.lock().store.list_events_for_record(rid)?)
    }

    /// Swaps in a fresh poll of `project` and flags running or queued
    /// records whose changes no longer carry a queue request.
    pub fn replace_snapshot(
        &self,
        project: &str,
        changes: Vec<ChangeInfo>,
    ) -> Result<SnapshotUpdate, EngineError> {
        let mut state = self.lock();
        let poll_id = state.store.next_poll_id()?;
        state
            .store
            .replace_project_changes(project, &changes, poll_id)?;
        state.snapshot.retain(|_, change| change.project != project);
        for change in &changes {
            state
                .snapshot
                .insert(change.change_id.clone(), change.clone());
        }

        let withdrawn: Vec<RecordId> = state
            .records
            .values()
            .filter(|record| {
                record.project == project
                    && matches!(record.status, MergeStatus::InProgress | MergeStatus::Queued)
                    && record.cancel.is_none()
            })
            .filter(|record| {
                record.change_ids().any(|change_id| {
                    state
                        .snapshot
                        .get(change_id)
                        .map_or(true, |change| !self.rules.is_requested(change))
                })
            })
            .map(|record| record.rid)
            .collect();

        let now = Utc::now();
        for rid in &withdrawn {
            state.set_cancel(
                *rid,
                CancelRequest {
                    reason: CancelReason::VoteWithdrawn,
                    requested_by: None,
                    at: now,
                },
            )?;
            info!(rid = %rid, project, "queue vote withdrawn, cancel requested");
        }

        state.emit(
            Event::new(EventKind::SnapshotRefreshed {
                changes: changes.len(),
            })
            .scoped(project),
        );
        Ok(SnapshotUpdate {
            changes: changes.len(),
            withdrawn,
        })
    }

    pub fn poll_failed(&self, project: &str, message: String) {
        self.emit(Event::new(EventKind::PollFailed { message }).scoped(project));
    }

    pub fn known_account(&self, account_id: i64) -> Result<bool, EngineError> {
        Ok(self.lock().store.load_account(account_id)?.is_some())
    }

    pub fn store_account(&self, account: &mq_core::AccountInfo) -> Result<(), EngineError> {
        Ok(self.lock().store.upsert_account(account)?)
    }

    pub fn account_ids(&self) -> Result<Vec<i64>, EngineError> {
        Ok(self.lock().store.list_account_ids()?)
    }

    pub fn leased_queues(&self) -> usize {
        self.lock().leases.active_count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mq_core::{
        ChangeStatus, CommitMeta, JobArtifacts, QueueSpec, Vote, WorkerFilter, CODE_REVIEW_LABEL,
        MERGE_QUEUE_LABEL,
    };
    use mq_source::{MemorySource, PostedLabel, SourceError};

    pub(crate) fn base_time() -> DateTime<Utc> {
        Utc::now() - Duration::hours(2)
    }

    pub(crate) fn change(id: &str, priority: Option<i64>, requested_min: i64) -> ChangeInfo {
        let base = base_time();
        let mut votes = BTreeMap::new();
        votes.insert(CODE_REVIEW_LABEL.to_string(), vec![Vote::new(1, 2, base)]);
        votes.insert(
            MERGE_QUEUE_LABEL.to_string(),
            vec![Vote::new(2, 1, base + Duration::minutes(requested_min))],
        );
        ChangeInfo {
            change_id: ChangeId::new(id),
            number: 1,
            project: "infra".to_string(),
            branch: "main".to_string(),
            subject: format!("change {id}"),
            owner_id: 2,
            status: ChangeStatus::New,
            current_revision: format!("rev-{id}"),
            patchset: 1,
            updated: base,
            votes,
            meta: CommitMeta {
                priority,
                ..CommitMeta::default()
            },
            request_time: None,
        }
        .with_request_time_from(MERGE_QUEUE_LABEL)
    }

    pub(crate) fn queue_spec(submit_with_rest: bool, coalesce_count: Option<usize>) -> QueueSpec {
        QueueSpec {
            project: "infra".to_string(),
            branch: "main".to_string(),
            name: None,
            build_steps: vec![vec!["make".to_string(), "check".to_string()]],
            build_env: BTreeMap::new(),
            merge_build_env: false,
            workdir: None,
            submit_with_rest,
            coalesce_count,
        }
    }

    fn engine_with(
        spec: QueueSpec,
        master: MasterConfig,
        store: SqliteStore,
    ) -> (MergeQueueEngine, Arc<MemorySource>) {
        let source = Arc::new(MemorySource::new());
        let queues = vec![QueueDef::compile(spec).expect("compile queue")];
        let engine = MergeQueueEngine::open(master, queues, source.clone(), store).expect("open engine");
        (engine, source)
    }

    fn seed(engine: &MergeQueueEngine, source: &MemorySource, changes: Vec<ChangeInfo>) {
        for change in &changes {
            source.upsert_change(change.clone());
        }
        engine
            .replace_snapshot("infra", changes)
            .expect("snapshot");
    }

    fn mk_store() -> SqliteStore {
        SqliteStore::open_in_memory().expect("in-memory store")
    }

    fn engine() -> (MergeQueueEngine, Arc<MemorySource>) {
        engine_with(queue_spec(true, None), MasterConfig::default(), mk_store())
    }

    fn request(worker: &str) -> JobRequest {
        JobRequest {
            worker_id: worker.to_string(),
            pid: Some(4242),
            filters: vec![WorkerFilter {
                project: "infra".to_string(),
                queue: "main".to_string(),
            }],
        }
    }

    fn report(worker: &str, status: MergeStatus) -> ResultReport {
        ResultReport {
            worker_id: worker.to_string(),
            status,
            artifacts: JobArtifacts {
                output: "build output".to_string(),
                ..JobArtifacts::default()
            },
        }
    }

    fn job_ids(job: &Job) -> Vec<&str> {
        job.changes.iter().map(|c| c.change_id.as_str()).collect()
    }

    /// Changes that received `value` on the queue label, in posting order.
    fn votes_posted(source: &MemorySource, value: i8) -> Vec<ChangeId> {
        source
            .posted_labels()
            .into_iter()
            .filter(|posted| posted.value == value)
            .map(|posted| posted.change_id)
            .collect()
    }

    /// Lets reviews spawned in the background reach the source.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn status_of(engine: &MergeQueueEngine, rid: u64) -> MergeStatus {
        engine
            .get_record(RecordId(rid))
            .expect("record exists")
            .status
    }

    #[tokio::test]
    async fn verified_head_merges_and_carries_the_train() {
        let (engine, source) = engine();
        seed(&engine, &source, vec![change("c1", None, 0), change("c2", None, 5)]);

        let response = engine.request_job(request("w1")).await.expect("request");
        let job = response.job.expect("job handed out");
        assert_eq!(job_ids(&job), vec!["c1"]);
        assert_eq!(job.rid, RecordId(1));
        assert_eq!(status_of(&engine, 2), MergeStatus::Queued);

        let outcome = engine
            .report_result(job.rid, report("w1", MergeStatus::Success))
            .await
            .expect("report");
        assert_eq!(
            outcome,
            ReportOutcome::Accepted {
                status: MergeStatus::Success
            }
        );
        assert_eq!(source.submitted(), vec![ChangeId::new("c1"), ChangeId::new("c2")]);

        let history = engine
            .get_history(&ScopeFilter::default(), PageRequest::default())
            .expect("history");
        let rows: Vec<(u64, MergeStatus, bool)> = history
            .items
            .iter()
            .map(|r| (r.rid.0, r.status, r.is_submitted()))
            .collect();
        assert_eq!(
            rows,
            vec![(2, MergeStatus::Success, true), (1, MergeStatus::Success, true)]
        );
        assert_eq!(engine.leased_queues(), 0);
        assert!(votes_posted(&source, -1).is_empty());
        assert_eq!(
            votes_posted(&source, 1),
            vec![ChangeId::new("c1"), ChangeId::new("c2")]
        );
    }

    #[tokio::test]
    async fn a_leased_queue_is_never_handed_out_twice() {
        let (engine, source) = engine();
        seed(&engine, &source, vec![change("c1", None, 0), change("c2", None, 5)]);

        let first = engine.request_job(request("w1")).await.expect("first");
        assert!(first.job.is_some());
        let second = engine.request_job(request("w2")).await.expect("second");
        assert_eq!(second.job, None);
        assert_eq!(engine.leased_queues(), 1);
    }

    #[tokio::test]
    async fn dispatch_is_deterministic_for_the_same_snapshot() {
        let snapshot = vec![
            change("c3", None, 9),
            change("c2", Some(0), 20),
            change("c1", None, 1),
        ];
        let mut picks = Vec::new();
        for _ in 0..2 {
            let (engine, source) = engine();
            seed(&engine, &source, snapshot.clone());
            let job = engine
                .request_job(request("w1"))
                .await
                .expect("request")
                .job
                .expect("job");
            picks.push(job_ids(&job).iter().map(|id| id.to_string()).collect::<Vec<_>>());
        }
        assert_eq!(picks[0], vec!["c2".to_string()]);
        assert_eq!(picks[0], picks[1]);
    }

    #[tokio::test]
    async fn duplicate_report_is_rejected_without_a_second_submit() {
        let (engine, source) = engine();
        seed(&engine, &source, vec![change("c1", None, 0)]);
        let job = engine
            .request_job(request("w1"))
            .await
            .expect("request")
            .job
            .expect("job");

        engine
            .report_result(job.rid, report("w1", MergeStatus::Success))
            .await
            .expect("first report");
        let again = engine
            .report_result(job.rid, report("w1", MergeStatus::StepFailed))
            .await
            .expect("second report");
        assert_eq!(
            again,
            ReportOutcome::Rejected {
                current: MergeStatus::Success
            }
        );
        assert_eq!(source.submitted().len(), 1);
        assert_eq!(status_of(&engine, 1), MergeStatus::Success);
    }

    #[tokio::test]
    async fn failed_head_cancels_the_train_and_writes_back() {
        let (engine, source) = engine();
        seed(&engine, &source, vec![change("c1", None, 0), change("c2", None, 5), change("c3", None, 6)]);
        let job = engine
            .request_job(request("w1"))
            .await
            .expect("request")
            .job
            .expect("job");

        engine
            .report_result(job.rid, report("w1", MergeStatus::StepFailed))
            .await
            .expect("report");
        assert_eq!(status_of(&engine, 1), MergeStatus::StepFailed);
        assert_eq!(status_of(&engine, 2), MergeStatus::Canceled);
        assert_eq!(status_of(&engine, 3), MergeStatus::Canceled);
        assert!(source.submitted().is_empty());
        assert_eq!(engine.leased_queues(), 0);

        let rejected: Vec<PostedLabel> = source
            .posted_labels()
            .into_iter()
            .filter(|posted| posted.value == -1)
            .collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].change_id, ChangeId::new("c1"));
        assert_eq!(rejected[0].label, MERGE_QUEUE_LABEL);
        assert_eq!(rejected[0].notify, Notify::All);

        let next = engine
            .request_job(request("w1"))
            .await
            .expect("request after failure")
            .job
            .expect("train changes are eligible again");
        assert_eq!(job_ids(&next), vec!["c2"]);
    }

    #[tokio::test]
    async fn refused_optimistic_submit_fails_and_cancels_behind_it() {
        let (engine, source) = engine();
        seed(&engine, &source, vec![change("c1", None, 0), change("c2", None, 5), change("c3", None, 6)]);
        source.refuse_submit(&ChangeId::new("c2"));
        let job = engine
            .request_job(request("w1"))
            .await
            .expect("request")
            .job
            .expect("job");

        engine
            .report_result(job.rid, report("w1", MergeStatus::Success))
            .await
            .expect("report");
        assert_eq!(source.submitted(), vec![ChangeId::new("c1")]);
        assert_eq!(status_of(&engine, 1), MergeStatus::Success);
        assert_eq!(status_of(&engine, 2), MergeStatus::StepFailed);
        assert_eq!(status_of(&engine, 3), MergeStatus::Canceled);
        assert_eq!(engine.leased_queues(), 0);
        assert_eq!(votes_posted(&source, -1), vec![ChangeId::new("c2")]);
    }

    #[tokio::test]
    async fn coalesced_queue_batches_changes() {
        let (engine, source) = engine_with(queue_spec(true, Some(2)), MasterConfig::default(), mk_store());
        seed(&engine, &source, vec![change("c1", None, 0), change("c2", None, 1), change("c3", None, 2)]);
        let job = engine
            .request_job(request("w1"))
            .await
            .expect("request")
            .job
            .expect("job");
        assert_eq!(job_ids(&job), vec!["c1", "c2"]);

        engine
            .report_result(job.rid, report("w1", MergeStatus::Success))
            .await
            .expect("report");
        assert_eq!(
            source.submitted(),
            vec![ChangeId::new("c1"), ChangeId::new("c2"), ChangeId::new("c3")]
        );
    }

    #[tokio::test]
    async fn self_merging_queue_never_calls_submit() {
        let (engine, source) = engine_with(queue_spec(false, None), MasterConfig::default(), mk_store());
        seed(&engine, &source, vec![change("c1", None, 0), change("c2", None, 1)]);
        let job = engine
            .request_job(request("w1"))
            .await
            .expect("request")
            .job
            .expect("job");
        assert!(job.self_merging);
        assert!(engine.get_record(RecordId(2)).is_none());

        engine
            .report_result(job.rid, report("w1", MergeStatus::Success))
            .await
            .expect("report");
        assert!(source.submitted().is_empty());
        assert!(engine
            .get_record(job.rid)
            .expect("record")
            .is_submitted());
    }

    #[tokio::test]
    async fn pause_waits_for_the_running_job() {
        let (engine, source) = engine();
        seed(&engine, &source, vec![change("c1", None, 0)]);
        let job = engine
            .request_job(request("w1"))
            .await
            .expect("request")
            .job
            .expect("job");

        assert!(!engine.set_pause("w1", true));
        assert_eq!(status_of(&engine, 1), MergeStatus::InProgress);
        assert_eq!(engine.cancel_status(job.rid).expect("probe").cancel, None);

        engine
            .report_result(job.rid, report("w1", MergeStatus::Success))
            .await
            .expect("report while paused");
        seed(&engine, &source, vec![change("c9", None, 30)]);
        let paused = engine.request_job(request("w1")).await.expect("request");
        assert!(paused.paused);
        assert_eq!(paused.job, None);

        engine.set_pause("w1", false);
        let resumed = engine.request_job(request("w1")).await.expect("request");
        assert!(resumed.job.is_some());
    }

    #[tokio::test]
    async fn expired_lease_times_out_and_reopens_the_queue() {
        let master = MasterConfig {
            max_job_duration_secs: 60,
            ..MasterConfig::default()
        };
        let (engine, source) = engine_with(queue_spec(true, None), master, mk_store());
        seed(&engine, &source, vec![change("c1", None, 0), change("c2", None, 5)]);
        let job = engine
            .request_job(request("w1"))
            .await
            .expect("request")
            .job
            .expect("job");

        let reaped = engine
            .reap_expired(Utc::now() + Duration::seconds(120))
            .await
            .expect("reap");
        assert_eq!(reaped, vec![job.rid]);
        assert_eq!(status_of(&engine, 1), MergeStatus::Timeout);
        assert_eq!(status_of(&engine, 2), MergeStatus::Canceled);
        assert_eq!(engine.leased_queues(), 0);
        assert_eq!(votes_posted(&source, -1), vec![ChangeId::new("c1")]);
        assert!(engine.cancel_status(job.rid).expect("probe").cancel.is_some());

        let late = engine
            .report_result(job.rid, report("w1", MergeStatus::Success))
            .await
            .expect("late report");
        assert_eq!(
            late,
            ReportOutcome::Rejected {
                current: MergeStatus::Timeout
            }
        );
        assert!(source.submitted().is_empty());
    }

    #[tokio::test]
    async fn withdrawn_vote_flags_running_record() {
        let (engine, source) = engine();
        seed(&engine, &source, vec![change("c1", None, 0)]);
        let job = engine
            .request_job(request("w1"))
            .await
            .expect("request")
            .job
            .expect("job");

        let mut withdrawn = change("c1", None, 0);
        withdrawn.votes.remove(MERGE_QUEUE_LABEL);
        let update = engine
            .replace_snapshot("infra", vec![withdrawn])
            .expect("snapshot");
        assert_eq!(update.withdrawn, vec![job.rid]);

        let probe = engine.cancel_status(job.rid).expect("probe");
        assert_eq!(probe.reason(), Some(CancelReason::VoteWithdrawn));
    }

    #[tokio::test]
    async fn explicit_cancel_is_recorded_once() {
        let (engine, source) = engine();
        seed(&engine, &source, vec![change("c1", None, 0)]);
        let job = engine
            .request_job(request("w1"))
            .await
            .expect("request")
            .job
            .expect("job");

        let first = engine
            .cancel(job.rid, Some("alice".to_string()))
            .expect("cancel");
        let second = engine.cancel(job.rid, Some("bob".to_string())).expect("cancel again");
        assert_eq!(first, second);
        assert!(matches!(engine.cancel(RecordId(99), None), Err(EngineError::UnknownRecord { .. })));

        engine
            .report_result(job.rid, report("w1", MergeStatus::Canceled))
            .await
            .expect("report canceled");
        assert_eq!(
            engine.cancel(job.rid, None).expect("cancel terminal"),
            CancelOutcome::AlreadyTerminal {
                current: MergeStatus::Canceled
            }
        );
    }

    #[tokio::test]
    async fn unknown_or_unreportable_results_are_errors() {
        let (engine, _) = engine();
        assert!(matches!(
            engine
                .report_result(RecordId(7), report("w1", MergeStatus::Success))
                .await,
            Err(EngineError::UnknownRecord { .. })
        ));
        assert!(matches!(
            engine
                .report_result(RecordId(7), report("w1", MergeStatus::InProgress))
                .await,
            Err(EngineError::UnreportableStatus { .. })
        ));
    }

    #[tokio::test]
    async fn restart_cancels_unfinished_records_and_continues_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("mq.sqlite");
        {
            let (engine, source) = engine_with(
                queue_spec(true, None),
                MasterConfig::default(),
                SqliteStore::open(&db).expect("open store"),
            );
            seed(&engine, &source, vec![change("c1", None, 0), change("c2", None, 5)]);
            engine
                .request_job(request("w1"))
                .await
                .expect("request")
                .job
                .expect("job");
        }

        let (engine, _) = engine_with(
            queue_spec(true, None),
            MasterConfig::default(),
            SqliteStore::open(&db).expect("reopen store"),
        );
        assert_eq!(status_of(&engine, 1), MergeStatus::Canceled);
        assert_eq!(status_of(&engine, 2), MergeStatus::Canceled);

        let job = engine
            .request_job(request("w1"))
            .await
            .expect("request")
            .job
            .expect("snapshot survives the restart");
        assert_eq!(job.rid, RecordId(3));
        // c1 ran before the restart; c2 never started
        assert_eq!(job_ids(&job), vec!["c2"]);
    }

    #[tokio::test]
    async fn queue_view_pages_and_filters() {
        let (engine, source) = engine();
        seed(&engine, &source, vec![change("c1", None, 0), change("c2", None, 1), change("c3", Some(5), 9)]);

        let page = engine.get_queue(&ScopeFilter::default(), PageRequest::new(Some(1), Some(1)));
        assert_eq!(page.count, 3);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].change.change_id, ChangeId::new("c1"));
        assert_eq!(page.items[0].position, 1);
        assert_eq!(page.items[0].queue, "infra/main");

        let other = ScopeFilter {
            project: Some("web".to_string()),
            branch: None,
        };
        assert_eq!(engine.get_queue(&other, PageRequest::default()).count, 0);
    }

    #[tokio::test]
    async fn status_reports_master_and_workers() {
        let (engine, _) = engine();
        let master = engine.status(None);
        assert!(master.alive);
        assert_eq!(master.pid, Some(std::process::id()));

        engine.request_job(request("w1")).await.expect("request");
        let worker = engine.status(Some("w1"));
        assert!(worker.alive);
        assert_eq!(worker.pid, Some(4242));
        assert!(!engine.status(Some("w9")).alive);
    }

    #[tokio::test]
    async fn events_are_broadcast_and_stored() {
        let (engine, source) = engine();
        let mut events = engine.subscribe();
        seed(&engine, &source, vec![change("c1", None, 0)]);
        let job = engine
            .request_job(request("w1"))
            .await
            .expect("request")
            .job
            .expect("job");

        let first = events.recv().await.expect("snapshot event");
        assert_eq!(first.kind_tag(), "snapshot_refreshed");
        let created = events.recv().await.expect("record event");
        assert_eq!(created.rid, Some(job.rid));

        let stored = engine.record_events(job.rid).expect("stored events");
        assert_eq!(stored[0].kind_tag(), "record_created");
    }

    #[tokio::test]
    async fn refused_verified_batch_keeps_success_and_spares_landed_changes() {
        let (engine, source) = engine_with(queue_spec(true, Some(2)), MasterConfig::default(), mk_store());
        seed(&engine, &source, vec![change("c1", None, 0), change("c2", None, 1), change("c3", None, 2)]);
        source.refuse_submit(&ChangeId::new("c2"));
        let job = engine
            .request_job(request("w1"))
            .await
            .expect("request")
            .job
            .expect("job");
        assert_eq!(job_ids(&job), vec!["c1", "c2"]);

        engine
            .report_result(job.rid, report("w1", MergeStatus::Success))
            .await
            .expect("report");
        assert_eq!(source.submitted(), vec![ChangeId::new("c1")]);

        let head = engine.get_record(job.rid).expect("head record");
        assert_eq!(head.status, MergeStatus::Success);
        assert!(!head.is_submitted());
        assert_eq!(head.landed, vec![ChangeId::new("c1")]);
        assert!(head.submit_refused());
        assert_eq!(status_of(&engine, 2), MergeStatus::Canceled);
        assert_eq!(engine.leased_queues(), 0);
        assert_eq!(votes_posted(&source, -1), vec![ChangeId::new("c2")]);

        let stored = engine
            .get_history(&ScopeFilter::default(), PageRequest::default())
            .expect("history");
        let stored_head = stored
            .items
            .iter()
            .find(|record| record.rid == job.rid)
            .expect("stored head");
        assert_eq!(stored_head.status, MergeStatus::Success);

        // c1 landed and c2 was refused; only c3 never ran
        let next = engine
            .request_job(request("w1"))
            .await
            .expect("request again")
            .job
            .expect("c3 is eligible again");
        assert_eq!(job_ids(&next), vec!["c3"]);
    }

    #[tokio::test]
    async fn refused_single_change_head_stays_verified() {
        let (engine, source) = engine();
        seed(&engine, &source, vec![change("c1", None, 0), change("c2", None, 5)]);
        source.refuse_submit(&ChangeId::new("c1"));
        let job = engine
            .request_job(request("w1"))
            .await
            .expect("request")
            .job
            .expect("job");

        engine
            .report_result(job.rid, report("w1", MergeStatus::Success))
            .await
            .expect("report");
        assert!(source.submitted().is_empty());
        let head = engine.get_record(job.rid).expect("head");
        assert_eq!(head.status, MergeStatus::Success);
        assert!(head.landed.is_empty());
        assert!(head.submit_refused());
        assert_eq!(status_of(&engine, 2), MergeStatus::Canceled);
        assert_eq!(votes_posted(&source, -1), vec![ChangeId::new("c1")]);

        let stored = engine
            .record_events(job.rid)
            .expect("events")
            .into_iter()
            .map(|event| event.kind_tag())
            .collect::<Vec<_>>();
        assert!(stored.contains(&"submit_refused"));
    }

    #[tokio::test]
    async fn dispatch_and_merge_are_announced_on_the_changes() {
        let master = MasterConfig {
            webfront_url: Some("https://mq.example.com/".to_string()),
            ..MasterConfig::default()
        };
        let (engine, source) = engine_with(queue_spec(true, None), master, mk_store());
        seed(&engine, &source, vec![change("c1", None, 0)]);
        let job = engine
            .request_job(request("w1"))
            .await
            .expect("request")
            .job
            .expect("job");
        settle().await;

        let started = source.posted_labels();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].change_id, ChangeId::new("c1"));
        assert_eq!(started[0].value, 0);
        assert_eq!(started[0].notify, Notify::Nobody);
        let message = started[0].message.clone().unwrap_or_default();
        assert!(message.contains("https://mq.example.com/history/1"), "{message}");

        engine
            .report_result(job.rid, report("w1", MergeStatus::Success))
            .await
            .expect("report");
        let posted = source.posted_labels();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[1].value, 1);
        assert_eq!(posted[1].notify, Notify::Nobody);
        assert!(posted[1]
            .message
            .as_deref()
            .unwrap_or_default()
            .contains("merged"));
    }

    #[tokio::test]
    async fn silent_master_posts_nothing() {
        let master = MasterConfig {
            silent: true,
            ..MasterConfig::default()
        };
        let (engine, source) = engine_with(queue_spec(true, None), master, mk_store());
        seed(&engine, &source, vec![change("c1", None, 0), change("c2", None, 5)]);
        let job = engine
            .request_job(request("w1"))
            .await
            .expect("request")
            .job
            .expect("job");
        engine
            .report_result(job.rid, report("w1", MergeStatus::StepFailed))
            .await
            .expect("report");
        settle().await;
        assert!(source.posted_labels().is_empty());
    }

    #[tokio::test]
    async fn result_from_another_worker_is_rejected() {
        let (engine, source) = engine();
        seed(&engine, &source, vec![change("c1", None, 0)]);
        let job = engine
            .request_job(request("w1"))
            .await
            .expect("request")
            .job
            .expect("job");

        let outcome = engine
            .report_result(job.rid, report("w2", MergeStatus::Success))
            .await
            .expect("report from w2");
        assert_eq!(
            outcome,
            ReportOutcome::Rejected {
                current: MergeStatus::InProgress
            }
        );
        assert_eq!(status_of(&engine, 1), MergeStatus::InProgress);
        assert!(source.submitted().is_empty());

        engine
            .report_result(job.rid, report("w1", MergeStatus::Success))
            .await
            .expect("report from w1");
        assert_eq!(source.submitted(), vec![ChangeId::new("c1")]);
    }

    #[tokio::test]
    async fn cascade_stopped_by_a_store_error_is_finished_by_the_reaper() {
        let (engine, source) = engine();
        seed(&engine, &source, vec![change("c1", None, 0), change("c2", None, 5)]);
        let job = engine
            .request_job(request("w1"))
            .await
            .expect("request")
            .job
            .expect("job");

        engine
            .lock()
            .store
            .connection()
            .execute_batch(
                r#"CREATE TRIGGER reject_submitted BEFORE UPDATE ON merge_records
                   WHEN NEW.payload_json LIKE '%"submitted_at":"%'
                   BEGIN SELECT RAISE(ABORT, 'disk is full'); END;"#,
            )
            .expect("install trigger");
        let failed = engine
            .report_result(job.rid, report("w1", MergeStatus::Success))
            .await;
        assert!(matches!(failed, Err(EngineError::Persistence(_))));
        assert_eq!(source.submitted(), vec![ChangeId::new("c1")]);
        assert_eq!(engine.leased_queues(), 1);
        assert!(engine.get_record(job.rid).is_some_and(|record| is_open(&record)));

        engine
            .lock()
            .store
            .connection()
            .execute_batch("DROP TRIGGER reject_submitted;")
            .expect("drop trigger");
        let reaped = engine
            .reap_expired(Utc::now() + Duration::seconds(1))
            .await
            .expect("reap");
        assert!(reaped.is_empty());
        assert_eq!(engine.leased_queues(), 0);
        assert_eq!(source.submitted(), vec![ChangeId::new("c1"), ChangeId::new("c2")]);
        assert!(engine.get_record(job.rid).expect("head").is_submitted());
        assert_eq!(status_of(&engine, 2), MergeStatus::Success);
    }

    /// Cancels `target` as soon as `after` has been submitted.
    struct CancelOnSubmit {
        inner: Arc<MemorySource>,
        after: ChangeId,
        target: RecordId,
        engine: Mutex<Option<Arc<MergeQueueEngine>>>,
    }

    #[async_trait::async_trait]
    impl ChangeSource for CancelOnSubmit {
        async fn list_changes(&self, project: &str, query: &str) -> Result<Vec<ChangeInfo>, SourceError> {
            self.inner.list_changes(project, query).await
        }

        async fn get_votes(&self, change_id: &ChangeId) -> Result<Vec<mq_source::LabelVote>, SourceError> {
            self.inner.get_votes(change_id).await
        }

        async fn post_label(
            &self,
            change_id: &ChangeId,
            revision: &str,
            label: &str,
            value: i8,
            message: Option<&str>,
            notify: Notify,
        ) -> Result<(), SourceError> {
            self.inner
                .post_label(change_id, revision, label, value, message, notify)
                .await
        }

        async fn submit_merge(&self, change_id: &ChangeId) -> Result<(), SourceError> {
            self.inner.submit_merge(change_id).await?;
            if *change_id == self.after {
                let engine = self
                    .engine
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone();
                if let Some(engine) = engine {
                    engine
                        .cancel(self.target, Some("alice".to_string()))
                        .expect("cancel during cascade");
                }
            }
            Ok(())
        }

        async fn fetch_account(&self, account_id: i64) -> Result<mq_core::AccountInfo, SourceError> {
            self.inner.fetch_account(account_id).await
        }
    }

    #[tokio::test]
    async fn cancel_arriving_mid_cascade_stops_the_train() {
        let memory = Arc::new(MemorySource::new());
        let source = Arc::new(CancelOnSubmit {
            inner: memory.clone(),
            after: ChangeId::new("c1"),
            target: RecordId(2),
            engine: Mutex::new(None),
        });
        let queues = vec![QueueDef::compile(queue_spec(true, None)).expect("compile queue")];
        let engine = Arc::new(
            MergeQueueEngine::open(MasterConfig::default(), queues, source.clone(), mk_store())
                .expect("open engine"),
        );
        *source.engine.lock().expect("hook lock") = Some(engine.clone());
        seed(&engine, &memory, vec![change("c1", None, 0), change("c2", None, 5), change("c3", None, 6)]);

        let job = engine
            .request_job(request("w1"))
            .await
            .expect("request")
            .job
            .expect("job");
        engine
            .report_result(job.rid, report("w1", MergeStatus::Success))
            .await
            .expect("report");

        assert_eq!(memory.submitted(), vec![ChangeId::new("c1")]);
        assert_eq!(status_of(&engine, 1), MergeStatus::Success);
        assert_eq!(status_of(&engine, 2), MergeStatus::Canceled);
        assert_eq!(status_of(&engine, 3), MergeStatus::Canceled);
        assert_eq!(engine.leased_queues(), 0);
        *source.engine.lock().expect("hook lock") = None;
    }
}
