pub mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::api::AppState;
use crate::engine::types::RunStatus;
use crate::engine::{Dispatcher, JobQueue, WorkerPool};
use crate::limiter::RateLimiter;
use crate::session::SessionManager;
use crate::storage::mem_store::MemStore;
use crate::storage::sqlite_store::SqliteStore;
use crate::storage::Store;
use crate::tools::ToolRegistry;
use crate::workflows::{self, WorkflowSource, YamlWorkflowSource};

use config::MentorflowConfig;

#[derive(Parser)]
#[command(name = "mentorflow", version, about = "Learning-session orchestrator")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to a mentorflow.yaml config file (default: auto-detect in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the API server and worker pool
    Serve {
        /// Host to bind to
        #[arg(long, env = "HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,

        /// SQLite database path
        #[arg(long, env = "DB_PATH")]
        db: Option<String>,

        /// Base URL for the reasoning-service endpoints
        #[arg(long, env = "AGENTS_BASE_URL")]
        agents_base_url: Option<String>,

        /// Directory of {key}.yaml workflow definitions
        #[arg(long, env = "WORKFLOWS_DIR")]
        workflows_dir: Option<PathBuf>,

        /// Worker pool size (default: CPU count)
        #[arg(long, env = "WORKERS")]
        workers: Option<usize>,
    },

    /// Dispatch a workflow for a user (workers pick the jobs up)
    Dispatch {
        /// User to dispatch for
        user: String,

        /// Workflow key
        workflow: String,

        /// Correlation/intent id
        #[arg(long)]
        intent: Option<String>,

        /// Dispatch payload as JSON string
        #[arg(long)]
        payload: Option<String>,

        /// SQLite database path
        #[arg(long, default_value = "data/mentorflow.db", env = "DB_PATH")]
        db: String,
    },

    /// List workflow runs
    List {
        /// Filter by status (running, completed, failed)
        #[arg(short, long)]
        status: Option<String>,

        /// Filter by user
        #[arg(short, long)]
        user: Option<String>,

        /// SQLite database path
        #[arg(long, default_value = "data/mentorflow.db", env = "DB_PATH")]
        db: String,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Inspect a specific run with its jobs and attempts
    Inspect {
        /// Run ID
        run_id: String,

        /// SQLite database path
        #[arg(long, default_value = "data/mentorflow.db", env = "DB_PATH")]
        db: String,
    },

    /// List registered reasoning-service tools
    Tools,

    /// List known workflow definitions
    Workflows {
        /// Directory of {key}.yaml workflow definitions
        #[arg(long, env = "WORKFLOWS_DIR")]
        workflows_dir: Option<PathBuf>,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    load_dotenv(cli.dotenv.as_deref());
    let config = MentorflowConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            db,
            agents_base_url,
            workflows_dir,
            workers,
        } => {
            cmd_serve(
                host.or(config.host).unwrap_or_else(|| "0.0.0.0".to_string()),
                port.or(config.port).unwrap_or(3000),
                db.or(config.db_path)
                    .unwrap_or_else(|| "data/mentorflow.db".to_string()),
                agents_base_url
                    .or(config.agents_base_url)
                    .unwrap_or_else(|| "http://127.0.0.1:8801".to_string()),
                workflows_dir.or(config.workflows_dir.map(PathBuf::from)),
                workers.or(config.workers),
                config.poll_interval_ms,
            )
            .await
        }
        Commands::Dispatch {
            user,
            workflow,
            intent,
            payload,
            db,
        } => cmd_dispatch(user, workflow, intent, payload, db).await,
        Commands::List {
            status,
            user,
            db,
            format,
        } => cmd_list(status, user, db, format).await,
        Commands::Inspect { run_id, db } => cmd_inspect(run_id, db).await,
        Commands::Tools => cmd_tools(),
        Commands::Workflows { workflows_dir } => {
            cmd_workflows(workflows_dir.or(config.workflows_dir.map(PathBuf::from))).await
        }
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory.
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {
                // No .env file found — silently skip
            }
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

async fn open_store(db: &str) -> Result<Arc<dyn Store>> {
    if let Some(parent) = std::path::Path::new(db).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
    }
    let store = SqliteStore::connect(db).await?;
    Ok(Arc::new(store))
}

#[allow(clippy::too_many_arguments)]
async fn cmd_serve(
    host: String,
    port: u16,
    db: String,
    agents_base_url: String,
    workflows_dir: Option<PathBuf>,
    workers: Option<usize>,
    poll_interval_ms: Option<u64>,
) -> Result<()> {
    let store = open_store(&db).await?;

    let limiter = Arc::new(RateLimiter::new(store.clone()));
    let registry = Arc::new(ToolRegistry::new(&agents_base_url, limiter.clone()));
    let queue = Arc::new(JobQueue::new(store.clone()));

    let mut dispatcher = Dispatcher::new(store.clone());
    if let Some(ref dir) = workflows_dir {
        let source: Arc<dyn WorkflowSource> = Arc::new(YamlWorkflowSource::new(dir));
        dispatcher = dispatcher.with_source(source);
    }
    let dispatcher = Arc::new(dispatcher);

    let sessions = Arc::new(SessionManager::new(store.clone(), registry.clone()));

    let mut pool = WorkerPool::new(queue, registry.clone());
    if let Some(n) = workers {
        pool = pool.with_workers(n);
    }
    if let Some(ms) = poll_interval_ms {
        pool = pool.with_poll_interval(Duration::from_millis(ms));
    }
    let _handles = pool.start();

    let state = Arc::new(AppState {
        store,
        dispatcher,
        sessions,
        registry,
        limiter,
    });

    crate::api::serve(&host, port, state).await
}

async fn cmd_dispatch(
    user: String,
    workflow: String,
    intent: Option<String>,
    payload_json: Option<String>,
    db: String,
) -> Result<()> {
    let payload = match payload_json {
        Some(json) => {
            serde_json::from_str(&json).with_context(|| "Failed to parse --payload JSON")?
        }
        None => serde_json::Value::Null,
    };

    let store = open_store(&db).await?;
    let dispatcher = Dispatcher::new(store);

    let receipt = dispatcher
        .dispatch(&user, &workflow, intent, payload)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    println!("Run ID: {}", receipt.run_id);
    println!("Status: {}", receipt.status);
    println!("Steps enqueued: {}", receipt.steps_enqueued);

    Ok(())
}

async fn cmd_list(
    status_filter: Option<String>,
    user: Option<String>,
    db: String,
    format: String,
) -> Result<()> {
    let store = open_store(&db).await?;

    let status = status_filter
        .as_deref()
        .map(|s| match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid status filter: {}", s)),
        })
        .transpose()?;

    let runs = store.list_runs(user.as_deref(), status).await?;

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<12} {:<10} {:<24}",
        "RUN ID", "WORKFLOW", "USER", "STATUS", "STARTED"
    );
    println!("{}", "-".repeat(106));

    for run in &runs {
        println!(
            "{:<38} {:<20} {:<12} {:<10} {:<24}",
            run.run_id,
            run.workflow_key,
            run.user_id,
            run.status,
            run.started.format("%Y-%m-%d %H:%M:%S"),
        );
    }

    println!("\nTotal: {} run(s)", runs.len());
    Ok(())
}

async fn cmd_inspect(run_id: String, db: String) -> Result<()> {
    let store = open_store(&db).await?;

    let run = store
        .get_run(&run_id)
        .await
        .with_context(|| format!("Run '{}' not found", run_id))?;
    let jobs = store.jobs_for_run(&run_id).await?;

    println!("Run: {} [{}] {}", run.run_id, run.workflow_key, run.status);
    println!("User: {}", run.user_id);
    println!("Started: {}", run.started.format("%Y-%m-%d %H:%M:%S"));

    println!("\nJobs:");
    for job in &jobs {
        let status_icon = match job.status {
            crate::engine::types::JobStatus::Done => "✓",
            crate::engine::types::JobStatus::Dead => "✗",
            crate::engine::types::JobStatus::Failed => "✗",
            crate::engine::types::JobStatus::Running => "⟳",
            crate::engine::types::JobStatus::Queued => "○",
        };
        println!(
            "  {} {} [{}/{}] attempts {}/{}",
            status_icon, job.step_id, job.payload.tool, job.payload.mode, job.attempts, job.max_attempts
        );

        let attempts = store.attempts_for_job(&job.job_id).await?;
        for attempt in &attempts {
            let outcome = if attempt.success { "ok" } else { "failed" };
            let code = attempt
                .status_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "      {} [{}] {}",
                outcome,
                code,
                attempt.error_text.as_deref().unwrap_or("")
            );
        }
    }

    Ok(())
}

fn cmd_tools() -> Result<()> {
    // Listing needs no persistence; back the registry with a throwaway store.
    let store: Arc<dyn Store> = Arc::new(MemStore::new());
    let limiter = Arc::new(RateLimiter::new(store));
    let registry = ToolRegistry::new("http://127.0.0.1:8801", limiter);

    println!("{:<12} {:<10} {:<10} DESCRIPTION", "TOOL", "VERSION", "PER-MIN");
    println!("{}", "-".repeat(72));

    for descriptor in registry.list() {
        println!(
            "{:<12} {:<10} {:<10} {}",
            descriptor.name, descriptor.version, descriptor.per_minute, descriptor.description
        );
    }

    Ok(())
}

async fn cmd_workflows(workflows_dir: Option<PathBuf>) -> Result<()> {
    let mut keys: Vec<String> = workflows::builtin_keys()
        .into_iter()
        .map(|k| k.to_string())
        .collect();

    if let Some(ref dir) = workflows_dir {
        let source = YamlWorkflowSource::new(dir);
        for key in source.keys().await? {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    keys.sort();

    println!("{:<20} {:<8} TRIGGER", "WORKFLOW", "STEPS");
    println!("{}", "-".repeat(60));

    for key in &keys {
        let spec = match workflows_dir {
            Some(ref dir) => match YamlWorkflowSource::new(dir).load(key).await? {
                Some(spec) => Some(spec),
                None => workflows::builtin(key),
            },
            None => workflows::builtin(key),
        };

        if let Some(spec) = spec {
            let trigger = match &spec.trigger {
                crate::engine::types::Trigger::Events(events) => {
                    format!("events: {}", events.join(", "))
                }
                crate::engine::types::Trigger::Cron(expr) => format!("cron: {}", expr),
            };
            println!("{:<20} {:<8} {}", spec.key, spec.steps.len(), trigger);
        }
    }

    Ok(())
}
