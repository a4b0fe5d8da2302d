#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("review platform request failed ({operation}): {source}")]
    Transport {
        operation: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("review platform returned HTTP {status} ({operation}): {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },
    #[error("unable to decode review platform response ({operation}): {source}")]
    Decode {
        operation: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("review platform response is missing data ({operation}): {message}")]
    Incomplete { operation: String, message: String },
    #[error("review platform client is misconfigured: {message}")]
    Config { message: String },
}

impl SourceError {
    /// Failures that a later poll cycle may not hit again.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SourceError::Config { .. })
    }

    /// True when the platform answered but refused the operation, e.g. a
    /// submit blocked by a merge conflict.
    pub fn is_refusal(&self) -> bool {
        matches!(self, SourceError::Status { status, .. } if (400..500).contains(status))
    }
}
