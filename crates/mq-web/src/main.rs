use clap::Parser;
use mq_core::{load_config, ConfigError};
use mq_source::{GerritRest, SourceError};
use mq_web::{run_web_server, WebError, WebState};
use mqd::{spawn_pollers, spawn_reaper, EngineError, MergeQueueEngine, PersistenceError, SqliteStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Merge queue master: polls the review platform and hands out jobs.
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(name = "mq-master", version)]
struct Cli {
    #[arg(long, short, default_value = "mq.toml")]
    config: PathBuf,
    /// Overrides `master.bind`.
    #[arg(long)]
    bind: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error("{0}")]
    Args(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    InvalidConfig(String),
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open store at {path}: {source}")]
    OpenStore {
        path: PathBuf,
        #[source]
        source: PersistenceError,
    },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Web(#[from] WebError),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mq_master=info,mq_web=info,mqd=info,mq_source=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(err) = run(Cli::parse()).await {
        eprintln!("mq-master failed: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), MainError> {
    let config = load_config(&cli.config)?;
    let source_config = config
        .source
        .clone()
        .ok_or_else(|| MainError::InvalidConfig("master needs a [source] section".to_string()))?;
    let bind = resolve_bind(cli.bind, &config.master.bind)?;

    ensure_parent_dir(&config.master.db_path)?;
    let store = SqliteStore::open(&config.master.db_path).map_err(|source| MainError::OpenStore {
        path: config.master.db_path.clone(),
        source,
    })?;
    let gerrit = GerritRest::from_config(&source_config)?;
    let engine = Arc::new(MergeQueueEngine::from_config(&config, Arc::new(gerrit), store)?);
    engine.resume_cascades().await?;

    let pollers = spawn_pollers(
        Arc::clone(&engine),
        source_config.query.clone(),
        Duration::from_secs(config.master.poll_period_secs),
    );
    let reaper = spawn_reaper(
        Arc::clone(&engine),
        Duration::from_secs(config.master.lease_check_interval_secs),
    );
    info!(
        queues = engine.queues().len(),
        projects = pollers.len(),
        "mq-master started"
    );

    let served = run_web_server(&bind, WebState::new(engine), shutdown_signal()).await;
    for handle in pollers {
        handle.abort();
    }
    reaper.abort();
    served?;
    info!("mq-master stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn resolve_bind(bind_override: Option<String>, config_bind: &str) -> Result<String, MainError> {
    let candidate = bind_override.unwrap_or_else(|| config_bind.to_string());
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return Err(MainError::Args("bind address must not be empty".to_string()));
    }
    Ok(trimmed.to_string())
}

fn ensure_parent_dir(path: &Path) -> Result<(), MainError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).map_err(|source| MainError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::{ensure_parent_dir, resolve_bind, Cli};
    use clap::Parser;
    use std::path::PathBuf;

    #[test]
    fn cli_defaults_to_local_config_without_bind_override() {
        let cli = Cli::try_parse_from(["mq-master"]).expect("parse");
        assert_eq!(
            cli,
            Cli {
                config: PathBuf::from("mq.toml"),
                bind: None,
            }
        );
    }

    #[test]
    fn cli_applies_config_and_bind_override() {
        let cli = Cli::try_parse_from(["mq-master", "--config", "/etc/mq.toml", "--bind", "0.0.0.0:9090"])
            .expect("parse");
        assert_eq!(cli.config, PathBuf::from("/etc/mq.toml"));
        assert_eq!(cli.bind.as_deref(), Some("0.0.0.0:9090"));
    }

    #[test]
    fn resolve_bind_prefers_override_and_rejects_blank_values() {
        let resolved = resolve_bind(Some("127.0.0.1:9999".to_string()), "127.0.0.1:8080")
            .expect("resolve bind");
        assert_eq!(resolved, "127.0.0.1:9999");

        let resolved = resolve_bind(None, "127.0.0.1:8080").expect("resolve fallback");
        assert_eq!(resolved, "127.0.0.1:8080");

        let err = resolve_bind(Some("   ".to_string()), "127.0.0.1:8080")
            .expect_err("blank override should fail");
        assert_eq!(err.to_string(), "bind address must not be empty");
    }

    #[test]
    fn ensure_parent_dir_accepts_bare_file_names() {
        ensure_parent_dir(&PathBuf::from("mq.sqlite")).expect("no parent to create");
    }
}
