//! genq CLI
//!
//! Submits one code-generation job against PostgreSQL and waits for it,
//! printing progress and timeout-stage messages as they arrive.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use genq_core::job::{Job, JobAction, JobRequest};
use genq_core::timeout::{TimeoutHooks, TimeoutMonitor, TimeoutStatus};
use genq_events::PgChangeFeed;
use genq_orchestrator::{JobOrchestrator, OrchestratorConfig};
use genq_store::{FixedSession, PgJobStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "genq")]
#[command(about = "Submit a code-generation job and wait for the result", long_about = None)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Owner the job is submitted as
    #[arg(long, env = "GENQ_OWNER_ID")]
    owner_id: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a new project
    Create(PromptArgs),
    /// Change an existing project
    Modify(PromptArgs),
    /// Repair a broken project
    Fix(PromptArgs),
}

#[derive(Args)]
struct PromptArgs {
    /// Natural-language request
    #[arg(required = true, num_args = 1..)]
    prompt: Vec<String>,

    /// Extra context as a JSON object
    #[arg(long)]
    context: Option<String>,
}

impl Command {
    fn into_request(self) -> Result<JobRequest> {
        let (action, args) = match self {
            Self::Create(args) => (JobAction::Create, args),
            Self::Modify(args) => (JobAction::Modify, args),
            Self::Fix(args) => (JobAction::Fix, args),
        };

        let mut request = JobRequest::new(args.prompt.join(" "), action);
        if let Some(raw) = args.context {
            let context = serde_json::from_str(&raw).context("--context must be valid JSON")?;
            request = request.with_context(context);
        }
        Ok(request)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "genq=info,genq_orchestrator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = OrchestratorConfig::from_env().context("invalid GENQ_* configuration")?;
    let request = cli.command.into_request()?;

    let pool = genq_store::create_pool(&cli.database_url)
        .await
        .context("failed to connect to the database")?;
    genq_store::run_migrations(&pool)
        .await
        .context("failed to apply migrations")?;

    let orchestrator = JobOrchestrator::from_config(
        Arc::new(PgJobStore::new(pool.clone())),
        Arc::new(FixedSession::signed_in(cli.owner_id)),
        Arc::new(PgChangeFeed::new(pool)),
        &config,
    );

    let id = orchestrator.submit(request).await?;
    println!("Submitted job {id}");

    let monitor = TimeoutMonitor::new(config.timeouts, stage_messages());
    monitor.start();
    let outcome = orchestrator
        .wait_for(&id, print_progress, config.wait_timeout)
        .await;
    monitor.stop();

    let job = outcome?;
    println!("Job {id} completed");
    if let Some(ms) = job.duration_ms {
        println!("Took {:.1}s", ms as f64 / 1000.0);
    }
    if let Some(result) = &job.result {
        println!("{}", serde_json::to_string_pretty(result)?);
    }
    Ok(())
}

fn print_progress(job: &Job) {
    match &job.status_message {
        Some(message) => println!("[{:>3}%] {} - {message}", job.progress, job.status),
        None => println!("[{:>3}%] {}", job.progress, job.status),
    }
}

fn stage_messages() -> TimeoutHooks {
    fn announce(status: &TimeoutStatus) {
        eprintln!("{}", status.message);
        if let Some(suggestion) = &status.suggestion {
            eprintln!("  {suggestion}");
        }
    }

    TimeoutHooks::new()
        .on_warning(announce)
        .on_soft_timeout(announce)
        .on_hard_timeout(announce)
        .on_abort(announce)
}
