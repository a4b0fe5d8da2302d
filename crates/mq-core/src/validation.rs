//! Validation for merge-queue configuration.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::{DaemonConfig, MasterConfig, MqConfig, QueueSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

impl ValidationIssue {
    fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            level: ValidationLevel::Error,
            code,
            message: message.into(),
        }
    }

    fn warning(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            level: ValidationLevel::Warning,
            code,
            message: message.into(),
        }
    }
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

impl Validate for MqConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = self.master.validate();

        let mut seen = HashSet::new();
        for queue in &self.queues {
            issues.extend(queue.validate());
            if !seen.insert(queue.key()) {
                issues.push(ValidationIssue::error(
                    "queue.duplicate",
                    format!("queue {} is defined more than once", queue.key()),
                ));
            }
        }

        if self.queues.is_empty() && self.daemon.is_none() {
            issues.push(ValidationIssue::warning(
                "queues.empty",
                "no queues configured, the master will never dispatch a job",
            ));
        }

        if let Some(daemon) = &self.daemon {
            issues.extend(daemon.validate());
        }

        issues
    }
}

impl Validate for MasterConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if self.poll_period_secs == 0 {
            issues.push(ValidationIssue::error(
                "master.poll_period.zero",
                "poll period cannot be 0",
            ));
        }
        if self.max_job_duration_secs == 0 {
            issues.push(ValidationIssue::error(
                "master.max_job_duration.zero",
                "max job duration cannot be 0",
            ));
        }
        if self.lease_check_interval_secs == 0 {
            issues.push(ValidationIssue::error(
                "master.lease_check_interval.zero",
                "lease check interval cannot be 0",
            ));
        }
        if self.review_label.trim().is_empty() || self.queue_label.trim().is_empty() {
            issues.push(ValidationIssue::error(
                "master.label.empty",
                "review and queue label names must be set",
            ));
        }
        issues
    }
}

impl Validate for QueueSpec {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let key = self.key();

        if self.project.trim().is_empty() {
            issues.push(ValidationIssue::error(
                "queue.project.empty",
                "queue project cannot be empty",
            ));
        }

        if let Err(err) = Regex::new(&format!("^(?:{})", self.branch)) {
            issues.push(ValidationIssue::error(
                "queue.branch.invalid",
                format!("branch pattern for {key} does not compile: {err}"),
            ));
        }

        if self.name.is_none() && !self.branch_is_literal() {
            issues.push(ValidationIssue::error(
                "queue.name.required",
                format!(
                    "queue on {} uses pattern '{}' and needs an explicit name",
                    self.project, self.branch
                ),
            ));
        }

        if let Some(name) = &self.name {
            if name.trim().is_empty() || name.contains('/') {
                issues.push(ValidationIssue::error(
                    "queue.name.invalid",
                    format!("queue name '{name}' must be non-empty and contain no '/'"),
                ));
            }
        }

        if self.build_steps.is_empty() {
            issues.push(ValidationIssue::warning(
                "queue.build_steps.empty",
                format!("{key} has no build steps, every record will verify trivially"),
            ));
        }

        if self
            .build_steps
            .iter()
            .any(|step| step.first().map_or(true, |program| program.trim().is_empty()))
        {
            issues.push(ValidationIssue::error(
                "queue.build_step.empty",
                format!("{key} has a build step without a program"),
            ));
        }

        if self.coalesce_count == Some(0) {
            issues.push(ValidationIssue::error(
                "queue.coalesce_count.zero",
                format!("{key} coalesce_count must be greater than zero"),
            ));
        }

        if !self.submit_with_rest && self.build_steps.is_empty() {
            issues.push(ValidationIssue::error(
                "queue.self_merge.no_steps",
                format!("{key} merges through its last build step but defines none"),
            ));
        }

        if let Some(workdir) = &self.workdir {
            if workdir.is_absolute() {
                issues.push(ValidationIssue::warning(
                    "queue.workdir.absolute",
                    format!(
                        "{key} workdir {} is absolute and escapes the queue workspace",
                        workdir.display()
                    ),
                ));
            }
        }

        issues
    }
}

impl Validate for DaemonConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if self.worker_id.trim().is_empty() {
            issues.push(ValidationIssue::error(
                "daemon.worker_id.empty",
                "worker_id cannot be empty",
            ));
        }
        if !self.master_url.starts_with("http://") && !self.master_url.starts_with("https://") {
            issues.push(ValidationIssue::error(
                "daemon.master_url.scheme",
                format!("master_url '{}' must be an http(s) URL", self.master_url),
            ));
        }
        if self.queues.is_empty() {
            issues.push(ValidationIssue::warning(
                "daemon.queues.empty",
                "worker serves no queues and will never receive a job",
            ));
        }
        if self.poll_period_secs == 0 {
            issues.push(ValidationIssue::error(
                "daemon.poll_period.zero",
                "worker poll period cannot be 0",
            ));
        }
        if self.cancel_poll_secs == 0 {
            issues.push(ValidationIssue::error(
                "daemon.cancel_poll.zero",
                "cancel poll interval cannot be 0",
            ));
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::{Validate, ValidationLevel};
    use crate::config::{parse_config, QueueSpec};

    fn queue(branch: &str) -> QueueSpec {
        QueueSpec {
            project: "infra".to_string(),
            branch: branch.to_string(),
            name: None,
            build_steps: vec![vec!["make".to_string()]],
            build_env: Default::default(),
            merge_build_env: false,
            workdir: None,
            submit_with_rest: true,
            coalesce_count: None,
        }
    }

    fn codes(issues: &[super::ValidationIssue]) -> Vec<&'static str> {
        issues.iter().map(|issue| issue.code).collect()
    }

    #[test]
    fn literal_queue_validates_cleanly() {
        assert!(queue("main").validate().is_empty());
    }

    #[test]
    fn broken_pattern_and_zero_batch_are_errors() {
        let mut def = queue("release/(");
        def.name = Some("releases".to_string());
        def.coalesce_count = Some(0);
        let issues = def.validate();
        let codes = codes(&issues);
        assert!(codes.contains(&"queue.branch.invalid"));
        assert!(codes.contains(&"queue.coalesce_count.zero"));
        assert!(issues.iter().all(|i| i.level == ValidationLevel::Error));
    }

    #[test]
    fn empty_program_and_self_merge_without_steps_are_errors() {
        let mut def = queue("main");
        def.build_steps = vec![vec![]];
        assert!(codes(&def.validate()).contains(&"queue.build_step.empty"));

        def.build_steps.clear();
        def.submit_with_rest = false;
        let issues = def.validate();
        assert!(codes(&issues).contains(&"queue.self_merge.no_steps"));
        assert!(codes(&issues).contains(&"queue.build_steps.empty"));
    }

    #[test]
    fn duplicate_queue_keys_are_rejected() {
        let config = parse_config(
            r#"
[[queues]]
project = "infra"
branch = "main"

[[queues]]
project = "infra"
branch = "ma.*"
name = "main"
"#,
        )
        .expect("parse config");
        let issues = config.validate();
        assert!(codes(&issues).contains(&"queue.duplicate"));
    }

    #[test]
    fn daemon_section_checks_identity_and_intervals() {
        let config = parse_config(
            r#"
[daemon]
worker_id = ""
master_url = "127.0.0.1:8081"
workspace_path = "/tmp/work"
log_path = "/tmp/logs"
cancel_poll_secs = 0
"#,
        )
        .expect("parse config");
        let issues = config.validate();
        let codes = codes(&issues);
        assert!(codes.contains(&"daemon.worker_id.empty"));
        assert!(codes.contains(&"daemon.master_url.scheme"));
        assert!(codes.contains(&"daemon.cancel_poll.zero"));
        assert!(codes.contains(&"daemon.queues.empty"));
        assert!(!codes.contains(&"queues.empty"));
    }
}
