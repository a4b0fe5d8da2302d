//! Gerrit REST implementation of [`ChangeSource`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use mq_core::{parse_commit_meta, AccountInfo, ChangeId, ChangeInfo, ChangeStatus, SourceConfig};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::source::{ChangeSource, LabelVote, Notify};

const XSSI_PREFIX: &str = ")]}'";
const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
struct Credentials {
    username: String,
    password: String,
}

#[derive(Debug, Clone)]
pub struct GerritRest {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<Credentials>,
}

impl GerritRest {
    /// Anonymous access when `credentials` is `None`; authenticated calls go
    /// through the `/a/` prefix.
    pub fn new(
        url: &str,
        credentials: Option<(String, String)>,
        accept_invalid_certs: bool,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let url = url.trim().trim_end_matches('/');
        if url.is_empty() {
            return Err(SourceError::Config {
                message: "review platform url must not be empty".to_string(),
            });
        }
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .timeout(timeout)
            .build()
            .map_err(|source| SourceError::Transport {
                operation: "build client".to_string(),
                source,
            })?;
        let credentials = credentials.map(|(username, password)| Credentials { username, password });
        let base_url = if credentials.is_some() {
            format!("{url}/a")
        } else {
            url.to_string()
        };
        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    /// Builds a client from config, reading the password from the named
    /// environment variable.
    pub fn from_config(config: &SourceConfig) -> Result<Self, SourceError> {
        let credentials = match (&config.username, &config.password_env) {
            (Some(username), Some(var)) => {
                let password = std::env::var(var).map_err(|_| SourceError::Config {
                    message: format!("password variable {var} is not set"),
                })?;
                Some((username.clone(), password))
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(SourceError::Config {
                    message: "username and password_env must be set together".to_string(),
                })
            }
            (None, None) => None,
        };
        Self::new(
            &config.url,
            credentials,
            config.accept_invalid_certs,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some(creds) => request.basic_auth(&creds.username, Some(&creds.password)),
            None => request,
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        operation: &str,
    ) -> Result<String, SourceError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|source| SourceError::Transport {
                operation: operation.to_string(),
                source,
            })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| SourceError::Transport {
                operation: operation.to_string(),
                source,
            })?;
        if !status.is_success() {
            return Err(SourceError::Status {
                operation: operation.to_string(),
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }
        Ok(body)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        operation: &str,
    ) -> Result<T, SourceError> {
        let url = format!("{}/{}", self.base_url, path);
        let body = self.send(self.client.get(url).query(query), operation).await?;
        decode(&body, operation)
    }

    async fn post_json(
        &self,
        path: &str,
        payload: &serde_json::Value,
        operation: &str,
    ) -> Result<(), SourceError> {
        let url = format!("{}/{}", self.base_url, path);
        self.send(self.client.post(url).json(payload), operation)
            .await
            .map(|_| ())
    }
}

fn strip_xssi(body: &str) -> &str {
    body.trim_start()
        .strip_prefix(XSSI_PREFIX)
        .unwrap_or(body)
}

fn decode<T: DeserializeOwned>(body: &str, operation: &str) -> Result<T, SourceError> {
    serde_json::from_str(strip_xssi(body)).map_err(|source| SourceError::Decode {
        operation: operation.to_string(),
        source,
    })
}

/// Gerrit timestamps look like `2026-03-01 10:00:00.000000000` and are UTC.
pub fn parse_gerrit_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn encode_id(change_id: &ChangeId) -> String {
    urlencoding::encode(change_id.as_str()).into_owned()
}

#[derive(Debug, Deserialize)]
struct GerritAccount {
    #[serde(rename = "_account_id")]
    account_id: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

impl From<GerritAccount> for AccountInfo {
    fn from(account: GerritAccount) -> Self {
        AccountInfo {
            account_id: account.account_id,
            name: account.name,
            email: account.email,
            username: account.username,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GerritCommit {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GerritRevision {
    #[serde(rename = "_number")]
    number: u32,
    #[serde(default)]
    commit: Option<GerritCommit>,
}

#[derive(Debug, Deserialize)]
struct GerritApproval {
    #[serde(rename = "_account_id")]
    account_id: i64,
    #[serde(default)]
    value: Option<i8>,
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GerritLabel {
    #[serde(default)]
    all: Vec<GerritApproval>,
}

#[derive(Debug, Deserialize)]
struct GerritChange {
    id: String,
    project: String,
    branch: String,
    #[serde(default)]
    subject: String,
    status: String,
    updated: String,
    #[serde(rename = "_number")]
    number: u64,
    owner: GerritAccount,
    #[serde(default)]
    current_revision: Option<String>,
    #[serde(default)]
    revisions: BTreeMap<String, GerritRevision>,
    #[serde(default)]
    labels: BTreeMap<String, GerritLabel>,
    #[serde(default, rename = "_more_changes")]
    more_changes: bool,
}

fn parse_status(raw: &str) -> Option<ChangeStatus> {
    match raw {
        "NEW" => Some(ChangeStatus::New),
        "MERGED" => Some(ChangeStatus::Merged),
        "ABANDONED" => Some(ChangeStatus::Abandoned),
        _ => None,
    }
}

impl GerritChange {
    /// Returns `None` for entries missing the revision or commit details the
    /// queue depends on.
    fn into_change_info(self) -> Option<ChangeInfo> {
        let status = parse_status(&self.status)?;
        let updated = parse_gerrit_timestamp(&self.updated)?;
        let revision_id = self.current_revision?;
        let revision = self.revisions.get(&revision_id)?;
        let meta = revision
            .commit
            .as_ref()
            .map(|commit| parse_commit_meta(&commit.message))
            .unwrap_or_default();
        Some(ChangeInfo {
            change_id: ChangeId(self.id),
            number: self.number,
            project: self.project,
            branch: self.branch,
            subject: self.subject,
            owner_id: self.owner.account_id,
            status,
            patchset: revision.number,
            current_revision: revision_id,
            updated,
            votes: BTreeMap::new(),
            meta,
            request_time: None,
        })
    }
}

fn label_votes(labels: BTreeMap<String, GerritLabel>) -> Vec<LabelVote> {
    let mut votes = Vec::new();
    for (label, detail) in labels {
        for approval in detail.all {
            let (Some(value), Some(at)) = (
                approval.value,
                approval.date.as_deref().and_then(parse_gerrit_timestamp),
            ) else {
                continue;
            };
            votes.push(LabelVote {
                account_id: approval.account_id,
                label: label.clone(),
                value,
                at,
            });
        }
    }
    votes
}

#[async_trait]
impl ChangeSource for GerritRest {
    async fn list_changes(
        &self,
        project: &str,
        query: &str,
    ) -> Result<Vec<ChangeInfo>, SourceError> {
        let search = format!("project:{project} {query}").trim().to_string();
        let mut changes = Vec::new();
        let mut start = 0usize;
        loop {
            let page: Vec<GerritChange> = self
                .get_json(
                    "changes/",
                    &[
                        ("q", search.clone()),
                        ("o", "CURRENT_REVISION".to_string()),
                        ("o", "CURRENT_COMMIT".to_string()),
                        ("n", PAGE_SIZE.to_string()),
                        ("S", start.to_string()),
                    ],
                    "list changes",
                )
                .await?;
            let fetched = page.len();
            let more = page.last().map_or(false, |change| change.more_changes);
            for change in page {
                let id = change.id.clone();
                match change.into_change_info() {
                    Some(info) => changes.push(info),
                    None => warn!(change = %id, "skipping change with incomplete details"),
                }
            }
            if !more || fetched == 0 {
                break;
            }
            start += fetched;
        }
        debug!(project, count = changes.len(), "listed changes");
        Ok(changes)
    }

    async fn get_votes(&self, change_id: &ChangeId) -> Result<Vec<LabelVote>, SourceError> {
        let change: GerritChange = self
            .get_json(
                &format!("changes/{}", encode_id(change_id)),
                &[("o", "DETAILED_LABELS".to_string())],
                "get votes",
            )
            .await?;
        Ok(label_votes(change.labels))
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
        let mut review = serde_json::json!({ "labels": { label: value } });
        if let Some(message) = message {
            review["message"] = serde_json::Value::String(message.to_string());
        }
        if notify == Notify::Nobody {
            review["notify"] = serde_json::Value::String("NONE".to_string());
        }
        self.post_json(
            &format!(
                "changes/{}/revisions/{}/review",
                encode_id(change_id),
                urlencoding::encode(revision)
            ),
            &review,
            "post label",
        )
        .await
    }

    async fn submit_merge(&self, change_id: &ChangeId) -> Result<(), SourceError> {
        self.post_json(
            &format!("changes/{}/submit", encode_id(change_id)),
            &serde_json::json!({}),
            "submit",
        )
        .await
    }

    async fn fetch_account(&self, account_id: i64) -> Result<AccountInfo, SourceError> {
        let account: GerritAccount = self
            .get_json(&format!("accounts/{account_id}"), &[], "fetch account")
            .await?;
        Ok(account.into())
    }
}
