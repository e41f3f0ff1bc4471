//! Unattended task dispatcher.
//!
//! `dispatcher run` hosts the executor until Ctrl-C; the other commands edit
//! the task store it reads (`.dispatcher/tasks.json` by default).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dispatcher::core::types::{NewTask, TaskStatus, TaskUpdate};
use dispatcher::executor::{ExecutorParts, ExecutorSettings, TaskExecutor};
use dispatcher::exit_codes;
use dispatcher::io::agent::CliAgent;
use dispatcher::io::config::{DEFAULT_CONFIG_PATH, DispatcherConfig, load_config};
use dispatcher::io::git::Git;
use dispatcher::io::notify::{LogSink, NotificationSink, StdoutSink};
use dispatcher::io::task_store::{JsonTaskStore, StoreError, TaskStore};
use dispatcher::io::verifier::GitRemoteVerifier;
use dispatcher::io::workspace::GitWorkspace;
use dispatcher::logging;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "dispatcher",
    version,
    about = "Run queued tasks through a coding agent and verify what it pushes"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the executor and process queued tasks until Ctrl-C.
    Run {
        /// Where task notifications go.
        #[arg(long, value_enum, default_value_t = SinkKind::Stdout)]
        notify: SinkKind,
    },
    /// Add a task to the store and print its id.
    Add {
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        area: Option<String>,
        #[arg(long)]
        notes: Option<String>,
        /// Park the task in the backlog instead of queueing it.
        #[arg(long)]
        backlog: bool,
    },
    /// List tasks, oldest first.
    List {
        /// Only show tasks with this status (e.g. `queued`, `stuck`).
        #[arg(long)]
        status: Option<String>,
    },
    /// Move a task to `queued`.
    Queue { id: String },
    /// Move a task to `cancelled`.
    Cancel { id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SinkKind {
    /// Print each notification on stdout.
    Stdout,
    /// Emit notifications as `info` log events.
    Log,
}

fn main() {
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("start tokio runtime: {err}");
            std::process::exit(exit_codes::INVALID);
        }
    };

    let code = match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_code_for(&err)
        }
    };
    // Dropping in-flight tasks kills any agent still running.
    runtime.shutdown_timeout(Duration::from_secs(5));
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let cfg = load_config(&cli.config)?;
    match cli.command {
        Command::Run { notify } => {
            logging::init("info");
            let sink: Arc<dyn NotificationSink> = match notify {
                SinkKind::Stdout => Arc::new(StdoutSink),
                SinkKind::Log => Arc::new(LogSink),
            };
            cmd_run(&cfg, sink).await
        }
        Command::Add {
            title,
            description,
            area,
            notes,
            backlog,
        } => {
            logging::init("warn");
            let store = JsonTaskStore::new(&cfg.store.path);
            let task = store
                .insert(NewTask {
                    title,
                    description,
                    notes,
                    area,
                    status: backlog.then_some(TaskStatus::Backlog),
                })
                .await?;
            println!("{}", task.id);
            Ok(exit_codes::OK)
        }
        Command::List { status } => {
            logging::init("warn");
            let filter = status.as_deref().map(str::parse::<TaskStatus>).transpose()?;
            let store = JsonTaskStore::new(&cfg.store.path);
            for task in store.list().await? {
                if filter.is_some_and(|wanted| wanted != task.status) {
                    continue;
                }
                println!("{}\t{}\t{}", task.id, task.status, task.title);
            }
            Ok(exit_codes::OK)
        }
        Command::Queue { id } => {
            logging::init("warn");
            set_status(&cfg.store.path, &id, TaskStatus::Queued).await
        }
        Command::Cancel { id } => {
            logging::init("warn");
            set_status(&cfg.store.path, &id, TaskStatus::Cancelled).await
        }
    }
}

async fn cmd_run(cfg: &DispatcherConfig, sink: Arc<dyn NotificationSink>) -> Result<i32> {
    let redactor = Arc::new(cfg.redactor());
    let git = Git::new(&cfg.repo.workdir);
    let agent = CliAgent::from_config(cfg);
    info!(env = ?agent.env_names(), "agent environment");

    let executor = TaskExecutor::new(
        ExecutorParts {
            store: Arc::new(JsonTaskStore::new(&cfg.store.path)),
            agent: Arc::new(agent),
            verifier: Arc::new(GitRemoteVerifier::new(
                git.clone(),
                &cfg.repo.remote,
                &cfg.repo.branch,
                Arc::clone(&redactor),
            )),
            workspace: Arc::new(GitWorkspace::new(
                git,
                cfg.repo.url.clone(),
                &cfg.repo.remote,
                &cfg.repo.branch,
            )),
            redactor,
        },
        ExecutorSettings::from_config(cfg),
    );

    match executor.start(sink).await {
        Ok(message) => eprintln!("{message}"),
        Err(err) => {
            eprintln!("{err}");
            return Ok(exit_codes::INVALID);
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("listen for ctrl-c")?;
    if let Ok(message) = executor.stop() {
        eprintln!("{message}");
    }

    let timeout = cfg.shutdown_timeout();
    if executor.wait_for_idle(timeout).await {
        Ok(exit_codes::OK)
    } else {
        eprintln!(
            "task still running after {}s, shutting down anyway",
            timeout.as_secs()
        );
        Ok(exit_codes::SHUTDOWN_TIMEOUT)
    }
}

async fn set_status(store_path: &Path, id: &str, status: TaskStatus) -> Result<i32> {
    let store = JsonTaskStore::new(store_path);
    store
        .set_status(id, &TaskUpdate::status(status))
        .await
        .with_context(|| format!("set task {id} to {status}"))?;
    println!("{id}\t{status}");
    Ok(exit_codes::OK)
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::NotFound(_)) => exit_codes::NOT_FOUND,
        _ => exit_codes::INVALID,
    }
}
