use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use crate::error::ExecError;

/// Shell-like rendering of an argv list for logs.
pub fn render_command(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '"' || c == '\'') {
                format!("'{}'", arg.replace('\'', r"'\''"))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Environment handed to a step: the queue's map, optionally layered over
/// the worker's own environment, plus the batch description.
pub fn build_env(
    base: &BTreeMap<String, String>,
    inherit: bool,
    extra: &[(String, String)],
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = if inherit {
        std::env::vars().collect()
    } else {
        BTreeMap::new()
    };
    env.extend(base.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(extra.iter().cloned());
    env
}

/// Starts a step in its own process group with output appended to the
/// given log files.
pub fn spawn_step(
    argv: &[String],
    cwd: &Path,
    env: &BTreeMap<String, String>,
    stdout: File,
    stderr: File,
) -> Result<Child, ExecError> {
    let rendered = render_command(argv);
    let Some((program, args)) = argv.split_first() else {
        return Err(ExecError::Spawn {
            command: rendered,
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty argv"),
        });
    };
    Command::new(program)
        .args(args)
        .current_dir(cwd)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .process_group(0)
        .spawn()
        .map_err(|source| ExecError::Spawn {
            command: rendered,
            source,
        })
}

/// Kills the whole process group of `child` and reaps it.
pub fn kill_process_group(child: &mut Child) -> io::Result<()> {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
    // addresses the group created by `process_group(0)`.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    child.wait().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::{build_env, kill_process_group, render_command, spawn_step};
    use std::collections::BTreeMap;
    use std::fs::{self, File};
    use std::time::{Duration, Instant};

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|part| part.to_string()).collect()
    }

    #[test]
    fn render_quotes_arguments_with_spaces() {
        assert_eq!(render_command(&argv(&["make", "check"])), "make check");
        assert_eq!(
            render_command(&argv(&["sh", "-c", "echo it's done"])),
            r"sh -c 'echo it'\''s done'"
        );
    }

    #[test]
    fn env_overlays_queue_map_and_batch_values() {
        let mut base = BTreeMap::new();
        base.insert("CI".to_string(), "1".to_string());
        base.insert("MQ_PROJECT".to_string(), "overridden".to_string());
        let env = build_env(&base, false, &[("MQ_PROJECT".to_string(), "infra".to_string())]);
        assert_eq!(env.len(), 2);
        assert_eq!(env["MQ_PROJECT"], "infra");

        std::env::set_var("MQ_EXEC_TEST_INHERITED", "yes");
        let env = build_env(&base, true, &[]);
        assert_eq!(env.get("MQ_EXEC_TEST_INHERITED").map(String::as_str), Some("yes"));
    }

    #[test]
    fn spawned_step_writes_to_log_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out_path = dir.path().join("out");
        let err_path = dir.path().join("err");
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hello".to_string());

        let mut child = spawn_step(
            &argv(&["/bin/sh", "-c", "echo $GREETING; echo oops >&2; exit 3"]),
            dir.path(),
            &env,
            File::create(&out_path).expect("stdout file"),
            File::create(&err_path).expect("stderr file"),
        )
        .expect("spawn");
        let status = child.wait().expect("wait");

        assert_eq!(status.code(), Some(3));
        assert_eq!(fs::read_to_string(&out_path).expect("read stdout"), "hello\n");
        assert_eq!(fs::read_to_string(&err_path).expect("read stderr"), "oops\n");
    }

    #[test]
    fn killing_process_group_stops_children() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut child = spawn_step(
            &argv(&["/bin/sh", "-c", "sleep 30 & sleep 30; wait"]),
            dir.path(),
            &BTreeMap::new(),
            File::create(dir.path().join("out")).expect("stdout file"),
            File::create(dir.path().join("err")).expect("stderr file"),
        )
        .expect("spawn");

        let started = Instant::now();
        kill_process_group(&mut child).expect("kill group");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(child.try_wait().expect("try_wait").is_some());
    }

    #[test]
    fn empty_argv_fails_to_spawn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = spawn_step(
            &[],
            dir.path(),
            &BTreeMap::new(),
            File::create(dir.path().join("out")).expect("stdout file"),
            File::create(dir.path().join("err")).expect("stderr file"),
        );
        assert!(result.is_err());
    }
}
