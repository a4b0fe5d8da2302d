//! Worker side of the job protocol.

use mq_core::{CancelProbe, JobRequest, JobResponse, RecordId, ReportOutcome, ResultReport};
use serde::de::DeserializeOwned;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("master request failed ({operation}): {source}")]
    Transport {
        operation: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("master returned HTTP {status} ({operation}): {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },
    #[error("unable to decode master response ({operation}): {source}")]
    Decode {
        operation: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("master client is misconfigured: {message}")]
    Config { message: String },
}

/// What a worker needs from the master.
pub trait JobClient {
    fn request_job(&self, request: &JobRequest) -> Result<JobResponse, ClientError>;
    fn report_result(&self, rid: RecordId, report: &ResultReport) -> Result<ReportOutcome, ClientError>;
    fn cancel_status(&self, rid: RecordId) -> Result<CancelProbe, ClientError>;
}

#[derive(Debug, Clone)]
pub struct HttpJobClient {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpJobClient {
    pub fn new(master_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let base_url = master_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ClientError::Config {
                message: "master url must not be empty".to_string(),
            });
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| ClientError::Transport {
                operation: "build client".to_string(),
                source,
            })?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Decodes the body of any status in `accepted`; other statuses become
    /// [`ClientError::Status`].
    fn decode<T: DeserializeOwned>(
        operation: &str,
        response: reqwest::blocking::Response,
        accepted: &[u16],
    ) -> Result<T, ClientError> {
        let status = response.status().as_u16();
        let body = response.text().map_err(|source| ClientError::Transport {
            operation: operation.to_string(),
            source,
        })?;
        if !accepted.contains(&status) {
            return Err(ClientError::Status {
                operation: operation.to_string(),
                status,
                body,
            });
        }
        serde_json::from_str(&body).map_err(|source| ClientError::Decode {
            operation: operation.to_string(),
            source,
        })
    }

    fn transport(operation: &str) -> impl FnOnce(reqwest::Error) -> ClientError + '_ {
        move |source| ClientError::Transport {
            operation: operation.to_string(),
            source,
        }
    }
}

impl JobClient for HttpJobClient {
    fn request_job(&self, request: &JobRequest) -> Result<JobResponse, ClientError> {
        let operation = "request job";
        let response = self
            .client
            .post(format!("{}/api/jobs/request", self.base_url))
            .json(request)
            .send()
            .map_err(Self::transport(operation))?;
        Self::decode(operation, response, &[200])
    }

    /// A rejected report comes back as 409 with the record's current status.
    fn report_result(&self, rid: RecordId, report: &ResultReport) -> Result<ReportOutcome, ClientError> {
        let operation = "report result";
        let response = self
            .client
            .post(format!("{}/api/jobs/{rid}/result", self.base_url))
            .json(report)
            .send()
            .map_err(Self::transport(operation))?;
        Self::decode(operation, response, &[200, 409])
    }

    fn cancel_status(&self, rid: RecordId) -> Result<CancelProbe, ClientError> {
        let operation = "cancel status";
        let response = self
            .client
            .get(format!("{}/api/jobs/{rid}/cancel", self.base_url))
            .send()
            .map_err(Self::transport(operation))?;
        Self::decode(operation, response, &[200])
    }
}
