use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use jeeves_agent::tools::memory_search::MemorySearchTool;
use jeeves_agent::tools::read_file::ReadFileTool;
use jeeves_agent::tools::write_file::WriteFileTool;
use jeeves_agent::{AgentRunner, AnthropicClient, LlmClient, PromptBuilder, ToolRegistry};
use jeeves_channels::{NullChannel, OutboundChannel};
use jeeves_core::{AgentLock, Content, JeevesConfig};
use jeeves_memory::{Embedder, MemoryIndex, NoopEmbedder, OpenAiEmbedder};
use jeeves_scheduler::{
    AgentInvoker, CronJob, CronScheduler, Heartbeat, HeartbeatOptions, JobHandler, JobStore,
    Schedule,
};
use jeeves_sessions::SessionStore;

#[derive(Parser)]
#[command(name = "jeeves", about = "Single-user personal assistant daemon")]
struct Cli {
    /// Config file path (default: ~/.jeeves/jeeves.toml, or JEEVES_CONFIG).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the assistant daemon (default).
    Run,
    /// Manage scheduled jobs.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
    /// Query the memory index from the command line.
    Search {
        query: String,
        #[arg(long, default_value_t = 6)]
        max_results: usize,
    },
    /// Rebuild the memory index from the workspace.
    Sync,
}

#[derive(Subcommand)]
enum JobsAction {
    /// List all jobs.
    List,
    /// Add a job. Exactly one of --at / --every-secs / --cron is required.
    Add {
        name: String,
        /// Message injected into the agent loop when the job fires.
        message: String,
        /// One-shot fire time, RFC 3339 (e.g. 2025-06-01T09:00:00Z).
        #[arg(long)]
        at: Option<String>,
        /// Repeat interval in seconds.
        #[arg(long)]
        every_secs: Option<u64>,
        /// Cron expression (5 or 6 fields).
        #[arg(long)]
        cron: Option<String>,
        /// IANA timezone for --cron (process-local when omitted).
        #[arg(long)]
        tz: Option<String>,
        /// Remove the job after one fire (defaults by schedule kind).
        #[arg(long)]
        delete_after_run: Option<bool>,
    },
    /// Remove a job by id.
    Remove { id: String },
}

/// Serialises every trigger source onto one agent turn at a time.
struct LockedInvoker {
    lock: AgentLock,
    runner: Arc<AgentRunner>,
}

#[async_trait]
impl AgentInvoker for LockedInvoker {
    async fn invoke(&self, session_key: &str, message: &str) -> anyhow::Result<String> {
        let key = session_key.to_string();
        let content = Content::Text(message.to_string());
        let runner = self.runner.clone();
        let reply = self
            .lock
            .with_lock(move || async move { runner.run(&key, content).await })
            .await??;
        Ok(reply)
    }
}

/// Cron firings become agent turns keyed `cron_<jobId>`; replies go out on
/// the configured channel.
struct CronHandler {
    invoker: Arc<LockedInvoker>,
    channel: Arc<dyn OutboundChannel>,
}

#[async_trait]
impl JobHandler for CronHandler {
    async fn on_job_due(&self, job: &CronJob) -> anyhow::Result<()> {
        let session_key = format!("cron_{}", job.id);
        let reply = self.invoker.invoke(&session_key, &job.message).await?;
        if !reply.trim().is_empty() {
            self.channel
                .send(&session_key, reply.trim())
                .await
                .map_err(|e| anyhow::anyhow!("outbound send failed: {e}"))?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // load config: --config > JEEVES_CONFIG > ~/.jeeves/jeeves.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("JEEVES_CONFIG").ok());
    let config = JeevesConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("config load failed ({e}); using defaults");
        JeevesConfig::default()
    });

    let default_filter = format!("jeeves={}", config.log_level.as_deref().unwrap_or("info"));
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(config).await,
        Command::Jobs { action } => jobs_command(config, action),
        Command::Search { query, max_results } => search_command(config, &query, max_results).await,
        Command::Sync => sync_command(config).await,
    }
}

// --- daemon ---------------------------------------------------------------

async fn run_daemon(config: JeevesConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(config.workspace())?;
    std::fs::create_dir_all(config.sessions_dir())?;
    std::fs::create_dir_all(config.memory_dir())?;
    info!(workspace = %config.workspace_dir.display(), "jeeves starting");

    let Some(anthropic) = config.providers.anthropic.clone() else {
        anyhow::bail!("no Anthropic credentials configured (providers.anthropic.api_key)");
    };
    let client: Arc<dyn LlmClient> = Arc::new(AnthropicClient::new(
        anthropic.api_key,
        Some(anthropic.base_url),
        config.agent.model.clone(),
    ));

    let store = Arc::new(SessionStore::new(config.sessions_dir()));
    let index = Arc::new(open_index(&config)?);
    if let Err(e) = index.sync().await {
        warn!(error = %e, "startup index sync failed; continuing with stale index");
    }

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(MemorySearchTool::new(index.clone())));
    tools.register(Arc::new(ReadFileTool::new(config.workspace())));
    tools.register(Arc::new(WriteFileTool::new(config.workspace())));

    let prompt = PromptBuilder::new(config.workspace(), client.is_oauth());
    let runner = Arc::new(AgentRunner::new(client, store, index, tools, prompt));

    let invoker = Arc::new(LockedInvoker {
        lock: AgentLock::new(),
        runner,
    });
    let channel: Arc<dyn OutboundChannel> = Arc::new(NullChannel);

    let job_store = Arc::new(JobStore::load(config.cron_store_path()));
    let scheduler = CronScheduler::new(
        job_store.clone(),
        Arc::new(CronHandler {
            invoker: invoker.clone(),
            channel: channel.clone(),
        }),
    );
    let scheduler_handle = scheduler.start();
    info!(jobs = job_store.list_jobs().len(), "cron scheduler running");

    let heartbeat = Arc::new(Heartbeat::new(
        config.workspace(),
        HeartbeatOptions::from_config(
            config.heartbeat.interval_minutes,
            &config.heartbeat.active_start,
            &config.heartbeat.active_end,
            config.heartbeat.channel_id.clone(),
        ),
        invoker.clone(),
        channel,
    ));
    let heartbeat_handle = heartbeat.start();

    info!("jeeves is up");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    scheduler.stop();
    heartbeat.stop();
    let _ = scheduler_handle.await;
    let _ = heartbeat_handle.await;

    Ok(())
}

// --- management commands --------------------------------------------------

fn jobs_command(config: JeevesConfig, action: JobsAction) -> anyhow::Result<()> {
    let store = JobStore::load(config.cron_store_path());
    match action {
        JobsAction::List => {
            let jobs = store.list_jobs();
            if jobs.is_empty() {
                println!("no jobs");
                return Ok(());
            }
            for job in jobs {
                let next = job
                    .next_run_at_ms
                    .and_then(chrono::DateTime::from_timestamp_millis)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                let status = job
                    .last_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {}  enabled={}  next={}  last={}",
                    job.id, job.name, job.enabled, next, status
                );
            }
        }
        JobsAction::Add {
            name,
            message,
            at,
            every_secs,
            cron,
            tz,
            delete_after_run,
        } => {
            let schedule = match (at, every_secs, cron) {
                (Some(ts), None, None) => Schedule::At {
                    at: ts
                        .parse()
                        .map_err(|e| anyhow::anyhow!("bad --at timestamp: {e}"))?,
                },
                (None, Some(secs), None) => Schedule::Every {
                    every_ms: secs.saturating_mul(1000),
                },
                (None, None, Some(expr)) => Schedule::Cron { expr, tz },
                _ => anyhow::bail!("exactly one of --at / --every-secs / --cron is required"),
            };
            let job = store.add_job(&name, schedule, &message, delete_after_run)?;
            println!("added job {}", job.id);
        }
        JobsAction::Remove { id } => {
            store.remove_job(&id)?;
            println!("removed job {id}");
        }
    }
    Ok(())
}

async fn search_command(
    config: JeevesConfig,
    query: &str,
    max_results: usize,
) -> anyhow::Result<()> {
    let index = open_index(&config)?;
    index.sync().await?;
    let hits = index.search(query, max_results).await?;
    if hits.is_empty() {
        println!("no matches");
        return Ok(());
    }
    for hit in hits {
        println!(
            "{:.2}  {} ({}-{})",
            hit.score, hit.file_path, hit.start_line, hit.end_line
        );
        for line in hit.text.lines().take(3) {
            println!("    {line}");
        }
    }
    Ok(())
}

async fn sync_command(config: JeevesConfig) -> anyhow::Result<()> {
    let index = open_index(&config)?;
    index.sync().await?;
    println!("index synced");
    Ok(())
}

fn open_index(config: &JeevesConfig) -> anyhow::Result<MemoryIndex> {
    let embedder: Box<dyn Embedder> = match config.providers.embeddings.clone() {
        Some(e) => Box::new(OpenAiEmbedder::new(e.api_key, e.base_url, e.model)),
        None => {
            info!("no embeddings backend configured; memory search is lexical-only");
            Box::new(NoopEmbedder)
        }
    };
    Ok(MemoryIndex::open(
        &config.index_db_path(),
        config.workspace(),
        embedder,
    )?)
}
