use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mq_core::{
    CancelCommand, CancelProbe, HistoryPage, JobRequest, JobResponse, MergeRecord, PauseCommand,
    QueuePage, RecordId, ReportOutcome, ResultReport, StatusReport,
};
use mqd::CancelOutcome;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::error::WebError;
use crate::model::{
    sse_event_name, HealthResponse, PageQuery, PauseResponse, RecordEventsResponse, StatusQuery,
    WorkerListResponse, WorkerView,
};
use crate::state::WebState;

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/jobs/request", post(request_job))
        .route("/api/jobs/{rid}/result", post(report_result))
        .route("/api/jobs/{rid}/cancel", get(cancel_status))
        .route("/api/merges/{rid}/cancel", post(cancel_merge))
        .route("/api/queue", get(get_queue))
        .route("/api/history", get(get_history))
        .route("/api/history/{rid}", get(get_record))
        .route("/api/history/{rid}/events", get(record_events))
        .route("/api/workers", get(list_workers))
        .route("/api/workers/{worker_id}/pause", post(pause_worker))
        .route("/api/status", get(status))
        .route("/api/events", get(stream_events))
        .with_state(state)
}

async fn health(State(state): State<WebState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        leased_queues: state.engine().leased_queues(),
    })
}

async fn request_job(
    State(state): State<WebState>,
    Json(request): Json<JobRequest>,
) -> Result<Json<JobResponse>, WebError> {
    if request.worker_id.trim().is_empty() {
        return Err(WebError::BadRequest("worker_id must not be empty".to_string()));
    }
    debug!(worker = %request.worker_id, filters = request.filters.len(), "job requested");
    Ok(Json(state.engine().request_job(request).await?))
}

/// A report against a record that is no longer running answers 409 with
/// the record's current status.
async fn report_result(
    State(state): State<WebState>,
    Path(rid): Path<u64>,
    Json(report): Json<ResultReport>,
) -> Result<Response, WebError> {
    let outcome = state.engine().report_result(RecordId(rid), report).await?;
    let status = match outcome {
        ReportOutcome::Accepted { .. } => StatusCode::OK,
        ReportOutcome::Rejected { .. } => StatusCode::CONFLICT,
    };
    Ok((status, Json(outcome)).into_response())
}

async fn cancel_status(
    State(state): State<WebState>,
    Path(rid): Path<u64>,
) -> Result<Json<CancelProbe>, WebError> {
    Ok(Json(state.engine().cancel_status(RecordId(rid))?))
}

async fn cancel_merge(
    State(state): State<WebState>,
    Path(rid): Path<u64>,
    Json(command): Json<CancelCommand>,
) -> Result<Response, WebError> {
    let outcome = state.engine().cancel(RecordId(rid), command.requested_by)?;
    let status = match outcome {
        CancelOutcome::Requested { .. } => StatusCode::OK,
        CancelOutcome::AlreadyTerminal { .. } => StatusCode::CONFLICT,
    };
    Ok((status, Json(outcome)).into_response())
}

async fn get_queue(State(state): State<WebState>, Query(query): Query<PageQuery>) -> Json<QueuePage> {
    Json(state.engine().get_queue(&query.scope(), query.page()))
}

async fn get_history(
    State(state): State<WebState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<HistoryPage>, WebError> {
    Ok(Json(state.engine().get_history(&query.scope(), query.page())?))
}

async fn get_record(
    State(state): State<WebState>,
    Path(rid): Path<u64>,
) -> Result<Json<MergeRecord>, WebError> {
    let record = state
        .engine()
        .get_record(RecordId(rid))
        .ok_or_else(|| WebError::NotFound {
            resource: format!("merge record {rid}"),
        })?;
    Ok(Json(record))
}

async fn record_events(
    State(state): State<WebState>,
    Path(rid): Path<u64>,
) -> Result<Json<RecordEventsResponse>, WebError> {
    let rid = RecordId(rid);
    if state.engine().get_record(rid).is_none() {
        return Err(WebError::NotFound {
            resource: format!("merge record {rid}"),
        });
    }
    Ok(Json(RecordEventsResponse {
        events: state.engine().record_events(rid)?,
    }))
}

async fn list_workers(State(state): State<WebState>) -> Json<WorkerListResponse> {
    let workers = state.engine().workers();
    Json(WorkerListResponse {
        workers: workers.iter().map(WorkerView::from).collect(),
    })
}

async fn pause_worker(
    State(state): State<WebState>,
    Path(worker_id): Path<String>,
    Json(command): Json<PauseCommand>,
) -> Json<PauseResponse> {
    let previous = state.engine().set_pause(&worker_id, command.paused);
    Json(PauseResponse {
        worker_id,
        paused: command.paused,
        previous,
    })
}

async fn status(State(state): State<WebState>, Query(query): Query<StatusQuery>) -> Json<StatusReport> {
    Json(state.engine().status(query.worker_id.as_deref()))
}

async fn stream_events(
    State(state): State<WebState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.engine().subscribe();
    let stream = BroadcastStream::new(rx).map(|message| {
        let event = match message {
            Ok(payload) => {
                let data = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
                SseEvent::default().event(sse_event_name(&payload)).data(data)
            }
            Err(_) => SseEvent::default().event("lagged").data("{}"),
        };
        Ok::<SseEvent, Infallible>(event)
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text("keepalive"),
    )
}
