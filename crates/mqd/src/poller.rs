//! Scheduled polling of the review platform.
//!
//! Each configured project is polled on its own task so a failing project
//! never delays the others. A failed poll leaves the previous snapshot in
//! place; the next tick simply tries again.

use chrono::Utc;
use mq_core::{ChangeInfo, RecordId};
use mq_source::{group_votes, ChangeSource, SourceError};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::{EngineError, MergeQueueEngine, SnapshotUpdate};

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Lists the open changes of `project`, attaches their vote histories and
/// swaps the result in as the project's snapshot.
pub async fn poll_project(
    engine: &MergeQueueEngine,
    source: &dyn ChangeSource,
    project: &str,
    query: &str,
) -> Result<SnapshotUpdate, PollError> {
    let listed = source.list_changes(project, query).await?;
    let queue_label = engine.master().queue_label.clone();
    let mut changes: Vec<ChangeInfo> = Vec::with_capacity(listed.len());
    for mut change in listed {
        change.votes = group_votes(source.get_votes(&change.change_id).await?);
        changes.push(change.with_request_time_from(&queue_label));
    }

    let accounts: BTreeSet<i64> = changes
        .iter()
        .flat_map(|change| {
            std::iter::once(change.owner_id)
                .chain(change.votes.values().flatten().map(|vote| vote.account_id))
        })
        .collect();
    cache_unknown_accounts(engine, source, accounts).await?;

    let update = engine.replace_snapshot(project, changes)?;
    debug!(project, changes = update.changes, "snapshot refreshed");
    Ok(update)
}

/// Fetches accounts the store has never seen. A failed fetch is logged and
/// retried on a later poll.
async fn cache_unknown_accounts(
    engine: &MergeQueueEngine,
    source: &dyn ChangeSource,
    accounts: BTreeSet<i64>,
) -> Result<(), EngineError> {
    for account_id in accounts {
        if engine.known_account(account_id)? {
            continue;
        }
        match source.fetch_account(account_id).await {
            Ok(account) => engine.store_account(&account)?,
            Err(err) => warn!(account_id, error = %err, "failed to fetch account"),
        }
    }
    Ok(())
}

/// Re-fetches every cached account. Returns how many were refreshed.
pub async fn sync_accounts(
    engine: &MergeQueueEngine,
    source: &dyn ChangeSource,
) -> Result<usize, PollError> {
    let mut refreshed = 0;
    for account_id in engine.account_ids()? {
        let account = source.fetch_account(account_id).await?;
        engine.store_account(&account)?;
        refreshed += 1;
    }
    Ok(refreshed)
}

/// One poll of one project with failures turned into a `PollFailed` event.
pub async fn run_poll_cycle(engine: &MergeQueueEngine, project: &str, query: &str) -> Option<SnapshotUpdate> {
    let source = engine.source();
    match poll_project(engine, source.as_ref(), project, query).await {
        Ok(update) => {
            if !update.withdrawn.is_empty() {
                let rids: Vec<String> = update.withdrawn.iter().map(RecordId::to_string).collect();
                info!(project, records = %rids.join(","), "cancel requested after vote withdrawal");
            }
            Some(update)
        }
        Err(err) => {
            warn!(project, error = %err, "poll failed, keeping previous snapshot");
            engine.poll_failed(project, err.to_string());
            None
        }
    }
}

/// Starts one polling task per configured project.
pub fn spawn_pollers(
    engine: Arc<MergeQueueEngine>,
    query: String,
    period: Duration,
) -> Vec<JoinHandle<()>> {
    engine
        .projects()
        .into_iter()
        .map(|project| {
            let engine = Arc::clone(&engine);
            let query = query.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                info!(project = %project, period_secs = period.as_secs(), "poller started");
                loop {
                    ticker.tick().await;
                    run_poll_cycle(&engine, &project, &query).await;
                }
            })
        })
        .collect()
}

/// Starts the periodic lease reaper.
pub fn spawn_reaper(engine: Arc<MergeQueueEngine>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match engine.reap_expired(Utc::now()).await {
                Ok(reaped) if !reaped.is_empty() => {
                    info!(count = reaped.len(), "reaped expired leases");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "lease reaping failed"),
            }
        }
    })
}
