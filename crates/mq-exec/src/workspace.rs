//! Queue workspaces and per-record build logs.

use mq_core::{Job, LogRefs, RecordId};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::ExecError;

/// Directory the steps of `job` run in: `<root>/<project>/<queue>[/<workdir>]`.
/// One per queue so incremental build state never crosses queues.
pub fn prepare_workspace(root: &Path, job: &Job) -> Result<PathBuf, ExecError> {
    let mut dir = root.join(&job.project).join(&job.queue_name);
    if let Some(workdir) = &job.workdir {
        dir = dir.join(workdir);
    }
    fs::create_dir_all(&dir).map_err(|source| ExecError::Workspace {
        path: dir.clone(),
        source,
    })?;
    Ok(dir)
}

/// The three log files of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLogs {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub log: PathBuf,
}

impl RecordLogs {
    pub fn for_record(log_root: &Path, rid: RecordId) -> Self {
        let stem = format!("{:06}", rid.0);
        Self {
            stdout: log_root.join(format!("{stem}.stdout")),
            stderr: log_root.join(format!("{stem}.stderr")),
            log: log_root.join(format!("{stem}.log")),
        }
    }

    /// Creates the log directory and truncates any logs left by an earlier
    /// run of the same record id.
    pub fn create(log_root: &Path, rid: RecordId) -> Result<Self, ExecError> {
        fs::create_dir_all(log_root).map_err(|source| ExecError::Log {
            path: log_root.to_path_buf(),
            source,
        })?;
        let logs = Self::for_record(log_root, rid);
        for path in [&logs.stdout, &logs.stderr, &logs.log] {
            File::create(path).map_err(|source| ExecError::Log {
                path: path.clone(),
                source,
            })?;
        }
        Ok(logs)
    }

    pub fn refs(&self) -> LogRefs {
        LogRefs {
            stdout: Some(self.stdout.display().to_string()),
            stderr: Some(self.stderr.display().to_string()),
            log: Some(self.log.display().to_string()),
        }
    }
}

pub fn open_append(path: &Path) -> Result<File, ExecError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| ExecError::Log {
            path: path.to_path_buf(),
            source,
        })
}

pub fn append_line(path: &Path, line: &str) -> Result<(), ExecError> {
    let mut file = open_append(path)?;
    writeln!(file, "{line}").map_err(|source| ExecError::Log {
        path: path.to_path_buf(),
        source,
    })
}

/// Last `max_bytes` of a log file, lossily decoded. Missing files read empty.
pub fn read_tail(path: &Path, max_bytes: u64) -> String {
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|meta| meta.len()).unwrap_or(0);
    if len > max_bytes && file.seek(SeekFrom::Start(len - max_bytes)).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}
