use chrono::{DateTime, Utc};
use mq_core::{QueueKey, RecordId};
use std::collections::HashMap;

/// Exclusive claim of one worker on one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLease {
    pub rid: RecordId,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

impl WorkerLease {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("queue {key} is already leased for record {rid}")]
pub struct LeaseHeld {
    pub key: QueueKey,
    pub rid: RecordId,
}

/// At most one lease per queue key.
#[derive(Debug, Clone, Default)]
pub struct LeaseTable {
    entries: HashMap<QueueKey, WorkerLease>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lease for `key`. Fails while any lease for the key is still
    /// recorded, expired or not; expired ones must be reaped first.
    pub fn acquire(&mut self, key: QueueKey, lease: WorkerLease) -> Result<(), LeaseHeld> {
        if let Some(held) = self.entries.get(&key) {
            return Err(LeaseHeld {
                key,
                rid: held.rid,
            });
        }
        self.entries.insert(key, lease);
        Ok(())
    }

    pub fn release(&mut self, key: &QueueKey) -> Option<WorkerLease> {
        self.entries.remove(key)
    }

    /// Moves the expiry of `key`'s lease to `at` so the next reap picks it
    /// up. Returns false when no lease is held.
    pub fn expire(&mut self, key: &QueueKey, at: DateTime<Utc>) -> bool {
        match self.entries.get_mut(key) {
            Some(lease) => {
                lease.expires_at = lease.expires_at.min(at);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &QueueKey) -> Option<&WorkerLease> {
        self.entries.get(key)
    }

    pub fn is_held(&self, key: &QueueKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn holder_of(&self, rid: RecordId) -> Option<&QueueKey> {
        self.entries
            .iter()
            .find(|(_, lease)| lease.rid == rid)
            .map(|(key, _)| key)
    }

    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    /// Leases past their expiry at `now`, oldest expiry first. The table is
    /// left untouched; the caller decides which ones to release.
    pub fn expired_at(&self, now: DateTime<Utc>) -> Vec<(QueueKey, WorkerLease)> {
        let mut expired: Vec<(QueueKey, WorkerLease)> = self
            .entries
            .iter()
            .filter(|(_, lease)| !lease.is_live_at(now))
            .map(|(key, lease)| (key.clone(), lease.clone()))
            .collect();
        expired.sort_by(|a, b| a.1.expires_at.cmp(&b.1.expires_at).then_with(|| a.0.cmp(&b.0)));
        expired
    }
}
