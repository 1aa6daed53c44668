mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use cv_core::config::Config;
use cv_core::error::CoordError;
use cv_core::types::{AgentStatus, DlqStatus, EscalationStatus, Severity, TaskStatus};
use cv_telemetry::logging::{self, LogFormat};
use uuid::Uuid;

use commands::Ctx;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// convoy CLI -- coordinate agents, tasks and orchestrator runs over a shared store.
#[derive(Parser)]
#[command(name = "cv", version, about)]
struct Cli {
    /// Config file (default: ~/.convoy/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Debug logging and full error detail.
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register, inspect and run worker agents.
    #[command(subcommand)]
    Agent(AgentCommand),
    /// Import and inspect tasks.
    #[command(subcommand)]
    Task(TaskCommand),
    /// Drive an epic to completion. Exit codes: 0 complete, 1 stalled or
    /// error, 75 checkpoint saved (rerun with --resume).
    Orchestrate(OrchestrateArgs),
    /// Show or record acceptance-criterion results for a task.
    Verify(VerifyArgs),
    #[command(subcommand)]
    Checkpoint(CheckpointCommand),
    #[command(subcommand)]
    Escalation(EscalationCommand),
    /// Inspect and retry dead-lettered events.
    #[command(subcommand)]
    Dlq(DlqCommand),
    #[command(subcommand)]
    Notifications(NotificationsCommand),
}

#[derive(Subcommand)]
pub enum AgentCommand {
    /// Register an agent identity.
    Register {
        name: String,
        /// Comma-separated capability tags.
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<String>,
    },
    List {
        #[arg(long)]
        status: Option<AgentStatus>,
        #[arg(long)]
        capability: Option<String>,
    },
    /// Show one agent and the tasks it holds.
    Status { id: Uuid },
    Deregister { id: Uuid },
    /// Run a worker loop that executes tasks with a shell command.
    Work(WorkArgs),
}

#[derive(Args)]
pub struct WorkArgs {
    pub name: String,
    #[arg(long, value_delimiter = ',')]
    pub capabilities: Vec<String>,
    /// Run per task; CONVOY_TASK_ID and friends are set in its environment.
    #[arg(long)]
    pub command: String,
    /// Claim ready tasks directly instead of waiting for offers.
    #[arg(long)]
    pub peer_swarm: bool,
    /// Restrict peer-swarm self-service to one epic.
    #[arg(long)]
    pub epic: Option<String>,
    #[arg(long, default_value_t = 1800)]
    pub timeout_secs: u64,
    #[arg(long, default_value_t = 30)]
    pub heartbeat_secs: u64,
    /// Exit after this many consecutive polls without work.
    #[arg(long)]
    pub max_idle_polls: Option<u32>,
}

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Import a JSON array of task definitions; existing IDs are skipped.
    Import { file: PathBuf },
    List {
        #[arg(long)]
        epic: Option<String>,
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long)]
        owner: Option<Uuid>,
    },
    Show { id: String },
}

#[derive(Args)]
pub struct OrchestrateArgs {
    #[arg(long)]
    pub epic: String,
    /// Print the assignment table without changing anything.
    #[arg(long)]
    pub dry_run: bool,
    /// Resume from the latest checkpoint of the epic, or the given one.
    #[arg(long, num_args = 0..=1, default_missing_value = "latest")]
    pub resume: Option<String>,
    /// Override `orchestrator.max_runtime_secs`.
    #[arg(long)]
    pub max_runtime: Option<u64>,
    /// Claim on agents' behalf instead of offering.
    #[arg(long)]
    pub direct: bool,
}

#[derive(Args)]
pub struct VerifyArgs {
    pub task: String,
    /// Record a result for this criterion before showing.
    #[arg(long)]
    pub record: Option<String>,
    #[arg(long, requires = "record")]
    pub fail: bool,
    #[arg(long, default_value = "")]
    pub detail: String,
}

#[derive(Subcommand)]
pub enum CheckpointCommand {
    Create {
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        epic: Option<String>,
        #[arg(long, default_value = "")]
        commit: String,
        /// Modified file; repeatable.
        #[arg(long = "file")]
        files: Vec<String>,
        #[arg(long, short)]
        message: String,
    },
    List {
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        epic: Option<String>,
    },
    Show { id: Uuid },
    /// Delete checkpoints older than the window.
    Prune {
        #[arg(long)]
        older_than_days: u32,
    },
}

#[derive(Subcommand)]
pub enum EscalationCommand {
    Create {
        #[arg(long)]
        task: String,
        #[arg(long)]
        reason: String,
        #[arg(long, default_value = "medium")]
        severity: Severity,
    },
    List {
        #[arg(long)]
        status: Option<EscalationStatus>,
        #[arg(long)]
        severity: Option<Severity>,
        #[arg(long)]
        task: Option<String>,
    },
    Resolve {
        id: Uuid,
        #[arg(long)]
        resolution: String,
    },
}

#[derive(Subcommand)]
pub enum DlqCommand {
    List {
        #[arg(long)]
        status: Option<DlqStatus>,
        #[arg(long)]
        event_type: Option<String>,
    },
    Show { id: Uuid },
    Retry { id: Uuid },
    /// Retry every matching entry (pending by default).
    RetryAll {
        #[arg(long)]
        event_type: Option<String>,
    },
    Stats,
    /// Abandon pending entries older than the window (default: dlq.retention_days).
    Cleanup {
        #[arg(long)]
        older_than_days: Option<u32>,
    },
}

#[derive(Subcommand)]
pub enum NotificationsCommand {
    List,
    /// Send a synthetic event through one hook.
    Test { hook: String },
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let verbose = cli.verbose;
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            report(&err, verbose);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let level = if cli.verbose {
        "debug"
    } else {
        config.general.log_level.as_str()
    };
    logging::init("cv", LogFormat::parse(&config.general.log_format), level);

    let ctx = Ctx::open(config, cli.json).await?;
    match cli.command {
        Commands::Agent(cmd) => commands::agent::run(&ctx, cmd).await,
        Commands::Task(cmd) => commands::task::run(&ctx, cmd).await,
        Commands::Orchestrate(args) => commands::orchestrate::run(&ctx, args).await,
        Commands::Verify(args) => commands::verify::run(&ctx, args).await,
        Commands::Checkpoint(cmd) => commands::checkpoint::run(&ctx, cmd).await,
        Commands::Escalation(cmd) => commands::escalation::run(&ctx, cmd).await,
        Commands::Dlq(cmd) => commands::dlq::run(&ctx, cmd).await,
        Commands::Notifications(cmd) => commands::notifications::run(&ctx, cmd).await,
    }
}

/// One line by default; verbose adds the error kind and the context chain.
fn report(err: &anyhow::Error, verbose: bool) {
    let kind = err.downcast_ref::<CoordError>().map(CoordError::kind);
    match (verbose, kind) {
        (true, Some(kind)) => eprintln!("error [{kind}]: {err:#}"),
        (true, None) => eprintln!("error: {err:#}"),
        (false, _) => eprintln!("error: {err}"),
    }
}
