//! Configuration for the merge-queue master and worker daemons.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::labels::{CODE_REVIEW_LABEL, MERGE_QUEUE_LABEL};
use crate::types::QueueKey;
use crate::validation::{Validate, ValidationIssue, ValidationLevel};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config at {path}: {}", summarize(.issues))]
    Invalid {
        path: PathBuf,
        issues: Vec<ValidationIssue>,
    },
    #[error("invalid branch pattern for queue {queue}: {source}")]
    Pattern {
        queue: String,
        #[source]
        source: regex::Error,
    },
}

fn summarize(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("[{}] {}", issue.code, issue.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Whole configuration file. The master reads `master`, `source` and
/// `queues`; a worker only needs `daemon`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqConfig {
    #[serde(default)]
    pub master: MasterConfig,
    #[serde(default)]
    pub source: Option<SourceConfig>,
    #[serde(default)]
    pub queues: Vec<QueueSpec>,
    #[serde(default)]
    pub daemon: Option<DaemonConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_poll_period_secs")]
    pub poll_period_secs: u64,
    #[serde(default = "default_max_job_duration_secs")]
    pub max_job_duration_secs: u64,
    #[serde(default = "default_lease_check_interval_secs")]
    pub lease_check_interval_secs: u64,
    /// Skip posting votes back to the review platform.
    #[serde(default)]
    pub silent: bool,
    #[serde(default = "default_review_label")]
    pub review_label: String,
    #[serde(default = "default_queue_label")]
    pub queue_label: String,
    /// Base URL of the dashboard, linked from review messages.
    #[serde(default)]
    pub webfront_url: Option<String>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            db_path: default_db_path(),
            poll_period_secs: default_poll_period_secs(),
            max_job_duration_secs: default_max_job_duration_secs(),
            lease_check_interval_secs: default_lease_check_interval_secs(),
            silent: false,
            review_label: default_review_label(),
            queue_label: default_queue_label(),
            webfront_url: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".mq/mq.sqlite")
}

fn default_poll_period_secs() -> u64 {
    60
}

fn default_max_job_duration_secs() -> u64 {
    3600
}

fn default_lease_check_interval_secs() -> u64 {
    5
}

fn default_review_label() -> String {
    CODE_REVIEW_LABEL.to_string()
}

fn default_queue_label() -> String {
    MERGE_QUEUE_LABEL.to_string()
}

/// Review-platform REST endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Name of the environment variable holding the HTTP password.
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Search query appended to `project:<name>` when listing changes.
    #[serde(default = "default_change_query")]
    pub query: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_change_query() -> String {
    "status:open label:Code-Review=+2".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// One queue definition as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub project: String,
    /// Branch-name pattern, matched from the start of the branch name.
    pub branch: String,
    /// Defaults to `branch`, which must then be a literal name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub build_steps: Vec<Vec<String>>,
    #[serde(default)]
    pub build_env: BTreeMap<String, String>,
    /// Start from the worker's own environment and overlay `build_env`.
    #[serde(default)]
    pub merge_build_env: bool,
    /// Working directory for steps, relative to the queue workspace.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// When false the last build step performs the merge itself.
    #[serde(default = "default_true")]
    pub submit_with_rest: bool,
    /// Largest batch verified as one record. Absent means one change per record.
    #[serde(default)]
    pub coalesce_count: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl QueueSpec {
    pub fn queue_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.branch)
    }

    pub fn key(&self) -> QueueKey {
        QueueKey::new(&self.project, self.queue_name())
    }

    pub fn branch_is_literal(&self) -> bool {
        regex::escape(&self.branch) == self.branch
    }

    pub fn batch_size(&self) -> usize {
        self.coalesce_count.unwrap_or(1).max(1)
    }
}

/// A queue definition with its branch pattern compiled.
#[derive(Debug, Clone)]
pub struct QueueDef {
    pub spec: QueueSpec,
    pub key: QueueKey,
    branch_pattern: Regex,
}

impl QueueDef {
    pub fn compile(spec: QueueSpec) -> Result<Self, ConfigError> {
        let key = spec.key();
        let branch_pattern =
            Regex::new(&format!("^(?:{})", spec.branch)).map_err(|source| {
                ConfigError::Pattern {
                    queue: key.to_string(),
                    source,
                }
            })?;
        Ok(Self {
            spec,
            key,
            branch_pattern,
        })
    }

    pub fn matches_branch(&self, branch: &str) -> bool {
        self.branch_pattern.is_match(branch)
    }

    /// Worker filters name either the queue or its branch pattern.
    pub fn matches_filter(&self, filter: &WorkerFilter) -> bool {
        filter.project == self.key.project
            && (filter.queue == self.key.name || filter.queue == self.spec.branch)
    }

    pub fn self_merging(&self) -> bool {
        !self.spec.submit_with_rest
    }
}

pub fn compile_queues(specs: &[QueueSpec]) -> Result<Vec<QueueDef>, ConfigError> {
    specs.iter().cloned().map(QueueDef::compile).collect()
}

/// A (project, queue) pair a worker is willing to serve.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerFilter {
    pub project: String,
    pub queue: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub worker_id: String,
    pub master_url: String,
    #[serde(default)]
    pub queues: Vec<WorkerFilter>,
    pub workspace_path: PathBuf,
    pub log_path: PathBuf,
    #[serde(default = "default_poll_period_secs")]
    pub poll_period_secs: u64,
    /// While this file exists the worker requests no jobs.
    #[serde(default)]
    pub offline_sentinel_path: Option<PathBuf>,
    #[serde(default)]
    pub pidfile_path: Option<PathBuf>,
    #[serde(default = "default_cancel_poll_secs")]
    pub cancel_poll_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_cancel_poll_secs() -> u64 {
    10
}

pub fn parse_config(contents: &str) -> Result<MqConfig, toml::de::Error> {
    toml::from_str(contents)
}

/// Reads, parses and validates a config file. Error-level issues are fatal.
pub fn load_config(path: impl AsRef<Path>) -> Result<MqConfig, ConfigError> {
    let path_ref = path.as_ref();
    let body = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: path_ref.to_path_buf(),
        source,
    })?;
    let config = parse_config(&body).map_err(|source| ConfigError::Parse {
        path: path_ref.to_path_buf(),
        source,
    })?;
    let errors: Vec<ValidationIssue> = config
        .validate()
        .into_iter()
        .filter(|issue| issue.level == ValidationLevel::Error)
        .collect();
    if !errors.is_empty() {
        return Err(ConfigError::Invalid {
            path: path_ref.to_path_buf(),
            issues: errors,
        });
    }
    Ok(config)
}
