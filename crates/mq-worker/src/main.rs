use clap::Parser;
use mq_core::{load_config, ConfigError};
use mq_worker::{ClientError, HttpJobClient, PidFile, PidFileError, WorkerDaemon, WorkerSettings};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stateless merge queue worker.
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(name = "mq-worker", version)]
struct Cli {
    #[arg(long, short, default_value = "mq.toml")]
    config: PathBuf,
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    InvalidConfig(String),
    #[error(transparent)]
    PidFile(#[from] PidFileError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("failed to install signal handler: {source}")]
    Signal {
        #[source]
        source: std::io::Error,
    },
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mq_worker=info,mq_exec=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("mq-worker failed: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), MainError> {
    let config = load_config(&cli.config)?;
    let daemon = config
        .daemon
        .ok_or_else(|| MainError::InvalidConfig("worker needs a [daemon] section".to_string()))?;

    let _pidfile = daemon.pidfile_path.as_ref().map(PidFile::acquire).transpose()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGTERM, SIGINT] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .map_err(|source| MainError::Signal { source })?;
    }

    let client = HttpJobClient::new(
        &daemon.master_url,
        Duration::from_secs(daemon.request_timeout_secs),
    )?;
    WorkerDaemon::new(client, WorkerSettings::from_config(&daemon)).run(&shutdown);
    Ok(())
}
