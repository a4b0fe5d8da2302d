use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mq_core::{load_config, MqConfig, PageRequest, ScopeFilter};
use mq_source::GerritRest;
use mqd::{run_poll_cycle, sync_accounts, MergeQueueEngine, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Offline administration of a merge queue store.
#[derive(Debug, Parser)]
#[command(name = "mqd", version)]
struct Cli {
    /// Path to the shared TOML configuration.
    #[arg(long, short, default_value = "mq.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll every configured project once and store the snapshot.
    Poll,
    /// Print the pending lists.
    Queue {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        offset: Option<usize>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Print merge records, newest first.
    History {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        offset: Option<usize>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Refresh every cached account from the review platform.
    SyncAccounts,
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mqd=info,mq_source=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("mqd failed: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;
    let engine = open_engine(&config)?;

    match cli.command {
        Command::Poll => {
            let query = config
                .source
                .as_ref()
                .map(|source| source.query.clone())
                .unwrap_or_default();
            let mut failed = Vec::new();
            for project in engine.projects() {
                match runtime.block_on(run_poll_cycle(&engine, &project, &query)) {
                    Some(update) => println!(
                        "{project}: {} changes, {} cancel requests",
                        update.changes,
                        update.withdrawn.len()
                    ),
                    None => failed.push(project),
                }
            }
            if !failed.is_empty() {
                bail!("poll failed for {}", failed.join(", "));
            }
        }
        Command::Queue {
            project,
            branch,
            offset,
            limit,
            json,
        } => {
            let page = engine.get_queue(&ScopeFilter { project, branch }, PageRequest::new(offset, limit));
            if json {
                println!("{}", serde_json::to_string_pretty(&page)?);
            } else {
                for entry in &page.items {
                    println!(
                        "{:<24} {:>3}  {:>8}  {}",
                        entry.queue, entry.position, entry.change.number, entry.change.subject
                    );
                }
                println!("{} of {} pending", page.items.len(), page.count);
            }
        }
        Command::History {
            project,
            branch,
            offset,
            limit,
            json,
        } => {
            let page = engine.get_history(&ScopeFilter { project, branch }, PageRequest::new(offset, limit))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&page)?);
            } else {
                for record in &page.items {
                    let changes: Vec<&str> = record.change_ids().map(|id| id.as_str()).collect();
                    println!(
                        "{:>6}  {:<12} {}/{}  {}",
                        record.rid.0,
                        record.status.as_str(),
                        record.project,
                        record.queue_name,
                        changes.join(",")
                    );
                }
                println!("{} of {} records", page.items.len(), page.count);
            }
        }
        Command::SyncAccounts => {
            let source = engine.source();
            let refreshed = runtime.block_on(sync_accounts(&engine, source.as_ref()))?;
            println!("refreshed {refreshed} accounts");
        }
    }
    Ok(())
}

fn open_engine(config: &MqConfig) -> anyhow::Result<MergeQueueEngine> {
    let Some(source_config) = config.source.as_ref() else {
        bail!("configuration has no [source] section");
    };
    let source = GerritRest::from_config(source_config).context("building review client")?;
    let store = SqliteStore::open(&config.master.db_path)
        .with_context(|| format!("opening {}", config.master.db_path.display()))?;
    MergeQueueEngine::open_for_admin(config, Arc::new(source), store).context("loading store")
}
