use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use mqd::EngineError;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error("not found: {resource}")]
    NotFound { resource: String },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {message}")]
    Internal { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl WebError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            WebError::NotFound { .. } | WebError::Engine(EngineError::UnknownRecord { .. }) => {
                StatusCode::NOT_FOUND
            }
            WebError::BadRequest(_) | WebError::Engine(EngineError::UnreportableStatus { .. }) => {
                StatusCode::BAD_REQUEST
            }
            WebError::Engine(_) | WebError::Io(_) | WebError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mq_core::{MergeStatus, RecordId};

    #[test]
    fn engine_errors_map_to_client_statuses() {
        let missing = WebError::from(EngineError::UnknownRecord { rid: RecordId(9) });
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
        assert!(missing.to_string().contains('9'));

        let unreportable = WebError::from(EngineError::UnreportableStatus {
            status: MergeStatus::InProgress,
        });
        assert_eq!(unreportable.status_code(), StatusCode::BAD_REQUEST);

        let internal = WebError::Internal {
            message: "boom".to_string(),
        };
        assert_eq!(internal.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
