use chrono::{DateTime, Duration, Utc};
use mq_core::StatusReport;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub pid: Option<u32>,
    /// `None` for workers paused before they ever called in.
    pub last_seen: Option<DateTime<Utc>>,
    pub paused: bool,
}

/// Workers known to the master. Pause flags survive until the master
/// restarts; a worker paused before it ever called in is remembered too.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, WorkerInfo>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a job request and returns whether the worker is paused.
    pub fn touch(&mut self, worker_id: &str, pid: Option<u32>, now: DateTime<Utc>) -> bool {
        let entry = self
            .workers
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerInfo {
                worker_id: worker_id.to_string(),
                pid,
                last_seen: None,
                paused: false,
            });
        entry.last_seen = Some(now);
        if pid.is_some() {
            entry.pid = pid;
        }
        entry.paused
    }

    /// Returns the previous pause flag.
    pub fn set_paused(&mut self, worker_id: &str, paused: bool) -> bool {
        match self.workers.get_mut(worker_id) {
            Some(worker) => std::mem::replace(&mut worker.paused, paused),
            None => {
                self.workers.insert(
                    worker_id.to_string(),
                    WorkerInfo {
                        worker_id: worker_id.to_string(),
                        pid: None,
                        last_seen: None,
                        paused,
                    },
                );
                false
            }
        }
    }

    pub fn is_paused(&self, worker_id: &str) -> bool {
        self.workers
            .get(worker_id)
            .map_or(false, |worker| worker.paused)
    }

    pub fn get(&self, worker_id: &str) -> Option<&WorkerInfo> {
        self.workers.get(worker_id)
    }

    /// A worker counts as alive while it was seen within `window`.
    pub fn status(&self, worker_id: &str, window: Duration, now: DateTime<Utc>) -> StatusReport {
        match self.workers.get(worker_id) {
            Some(worker) => StatusReport {
                alive: worker
                    .last_seen
                    .map_or(false, |seen| now - seen <= window),
                paused: worker.paused,
                pid: worker.pid,
                worker_id: Some(worker.worker_id.clone()),
                last_seen: worker.last_seen,
            },
            None => StatusReport {
                alive: false,
                paused: false,
                pid: None,
                worker_id: Some(worker_id.to_string()),
                last_seen: None,
            },
        }
    }

    pub fn list(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> = self.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn touch_tracks_pid_and_liveness() {
        let mut registry = WorkerRegistry::new();
        assert!(!registry.touch("w1", Some(41), now()));
        registry.touch("w1", None, now() + Duration::seconds(30));

        let status = registry.status("w1", Duration::seconds(120), now() + Duration::seconds(60));
        assert!(status.alive);
        assert_eq!(status.pid, Some(41));
        assert_eq!(status.last_seen, Some(now() + Duration::seconds(30)));

        let stale = registry.status("w1", Duration::seconds(120), now() + Duration::seconds(600));
        assert!(!stale.alive);
        assert!(!registry.status("ghost", Duration::seconds(120), now()).alive);
    }

    #[test]
    fn pause_applies_to_known_and_unknown_workers() {
        let mut registry = WorkerRegistry::new();
        assert!(!registry.set_paused("w2", true));
        assert!(registry.touch("w2", Some(7), now()));
        let status = registry.status("w2", Duration::seconds(120), now());
        assert!(status.paused);
        assert!(status.alive);

        assert!(registry.set_paused("w2", false));
        assert!(!registry.is_paused("w2"));
        assert_eq!(registry.list().len(), 1);
    }
}
