//! Commit-message trailer metadata.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_PRIORITY: i64 = 100;

/// `Key: value` lines found in a commit message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub closes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolves: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl CommitMeta {
    /// Lower dispatches first.
    pub fn priority(&self) -> i64 {
        self.priority.unwrap_or(DEFAULT_PRIORITY)
    }
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
}

/// Scans every line of `message` for trailers.
///
/// `Closes` and `Resolves` may repeat and accumulate comma separated items.
/// A `Priority` that is not an integer is ignored. Later keys overwrite
/// earlier ones.
pub fn parse_commit_meta(message: &str) -> CommitMeta {
    let mut meta = CommitMeta::default();
    for line in message.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            continue;
        }
        match key {
            "Closes" => meta.closes.extend(split_list(value)),
            "Resolves" => meta.resolves.extend(split_list(value)),
            "Priority" => {
                if let Ok(priority) = value.trim().parse::<i64>() {
                    meta.priority = Some(priority);
                }
            }
            other => {
                meta.extra
                    .insert(other.to_string(), value.trim().to_string());
            }
        }
    }
    meta
}
