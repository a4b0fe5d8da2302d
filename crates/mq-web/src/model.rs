use chrono::{DateTime, Utc};
use mq_core::{Event, PageRequest, ScopeFilter};
use mqd::WorkerInfo;
use serde::{Deserialize, Serialize};

/// Query string of the queue and history views.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl PageQuery {
    pub fn scope(&self) -> ScopeFilter {
        ScopeFilter {
            project: self.project.clone(),
            branch: self.branch.clone(),
        }
    }

    pub fn page(&self) -> PageRequest {
        PageRequest::new(self.offset, self.limit)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub worker_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseResponse {
    pub worker_id: String,
    pub paused: bool,
    pub previous: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerView {
    pub worker_id: String,
    pub pid: Option<u32>,
    pub last_seen: Option<DateTime<Utc>>,
    pub paused: bool,
}

impl From<&WorkerInfo> for WorkerView {
    fn from(worker: &WorkerInfo) -> Self {
        Self {
            worker_id: worker.worker_id.clone(),
            pid: worker.pid,
            last_seen: worker.last_seen,
            paused: worker.paused,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerListResponse {
    pub workers: Vec<WorkerView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEventsResponse {
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub leased_queues: usize,
}

/// SSE event name for an engine event.
pub fn sse_event_name(event: &Event) -> &'static str {
    event.kind_tag()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mq_core::{EventKind, DEFAULT_PAGE_LIMIT};

    #[test]
    fn page_query_defaults_and_scope() {
        let query = PageQuery {
            project: Some("infra".to_string()),
            ..PageQuery::default()
        };
        assert_eq!(query.page().offset, 0);
        assert_eq!(query.page().limit, DEFAULT_PAGE_LIMIT);
        assert!(query.scope().matches("infra", "release"));
        assert!(!query.scope().matches("docs", "main"));
    }

    #[test]
    fn event_names_follow_event_kind() {
        let event = Event::new(EventKind::LeaseReleased);
        assert_eq!(sse_event_name(&event), "lease_released");
    }
}
