use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use taskloom_core::handlers::{
    EchoHandler, MemoryHandler, PlannerHandler, SecurityHandler, ValidationHandler,
};
use taskloom_core::{
    Config, ConfigLoader, ExecutionMode, HandlerKind, Orchestrator, Planner, SecurityContext,
    TelemetryOptions, TemplatePlanner, Worker, init_telemetry,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "taskloom", version, about = "Taskloom orchestration interface")]
struct Cli {
    /// Path to a taskloom.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plan and execute a goal end-to-end.
    Run(RunArgs),
    /// Start a distributed worker loop.
    Worker(WorkerArgs),
    /// Inspect the event bus dead-letter queue after a run.
    Dlq(DlqArgs),
}

#[derive(Copy, Clone, Debug, ValueEnum, Default)]
enum ModeArg {
    #[default]
    Sequential,
    Parallel,
    Distributed,
    Streaming,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Sequential => ExecutionMode::Sequential,
            ModeArg::Parallel => ExecutionMode::Parallel,
            ModeArg::Distributed => ExecutionMode::Distributed,
            ModeArg::Streaming => ExecutionMode::Streaming,
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// The goal to plan and execute.
    goal: String,

    /// Execution mode for the planned graph.
    #[arg(long, value_enum, default_value_t = ModeArg::Sequential)]
    mode: ModeArg,

    /// Acting user id.
    #[arg(long, default_value = "cli-user")]
    user: String,

    /// Print the full report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    /// Worker identifier; defaults to one derived from the process id.
    #[arg(long)]
    worker_id: Option<String>,
}

#[derive(Args, Debug)]
struct DlqArgs {
    /// Re-publish dead letters instead of only listing them.
    #[arg(long)]
    retry: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::load(cli.config.clone())?;
    init_telemetry(TelemetryOptions::from_logging(&config.logging))?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        match cli.command {
            Command::Run(args) => run_goal(config, args).await,
            Command::Worker(args) => run_worker(config, args).await,
            Command::Dlq(args) => inspect_dlq(config, args).await,
        }
    })
}

fn build_orchestrator(config: Config) -> Orchestrator {
    let orchestrator = Orchestrator::builder(config).build();
    register_handlers(&orchestrator);
    orchestrator
}

fn register_handlers(orchestrator: &Orchestrator) {
    orchestrator.register_handler(Arc::new(SecurityHandler::new(orchestrator.security())));
    orchestrator.register_handler(Arc::new(ValidationHandler::new(orchestrator.validation())));
    orchestrator.register_handler(Arc::new(MemoryHandler::new(orchestrator.memory())));
    orchestrator.register_handler(Arc::new(PlannerHandler::new(Arc::new(TemplatePlanner))));
    // Demo stand-ins for the business handlers.
    for kind in [
        HandlerKind::Research,
        HandlerKind::Code,
        HandlerKind::DataProcessing,
        HandlerKind::Api,
        HandlerKind::FileSystem,
    ] {
        orchestrator.register_handler(Arc::new(EchoHandler::new(kind)));
    }
}

async fn run_goal(config: Config, args: RunArgs) -> Result<()> {
    let orchestrator = build_orchestrator(config);
    orchestrator.start();

    let ctx = SecurityContext::new(args.user.clone())
        .authenticated()
        .with_scopes(vec![
            taskloom_core::PermissionScope::Read,
            taskloom_core::PermissionScope::Write,
            taskloom_core::PermissionScope::Execute,
        ]);

    let mut graph = TemplatePlanner.plan(&args.goal, &ctx).await?;
    graph.execution_mode = args.mode.into();

    info!(graph_id = %graph.graph_id, goal = %args.goal, "executing goal");
    let report = orchestrator.process_goal(graph, ctx).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("graph:  {}", report.graph_id);
        println!("status: {}", report.status.as_str());
        println!("risk:   {}", report.risk_level.as_str());
        println!(
            "nodes:  {}/{} completed in {:.2}s",
            report.completed_nodes.len(),
            report.total_nodes,
            report.execution_time_seconds
        );
        for error in &report.errors {
            println!("error:  {}: {}", error.node_id, error.error);
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}

async fn run_worker(config: Config, args: WorkerArgs) -> Result<()> {
    let worker_id = args
        .worker_id
        .unwrap_or_else(|| format!("worker-{}", std::process::id()));

    let orchestrator = build_orchestrator(config);
    orchestrator.start();

    let worker = Worker::new(
        worker_id,
        orchestrator.queue(),
        orchestrator.bus(),
        orchestrator.registry(),
        orchestrator.validation(),
    );

    let handle = worker.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = handle.send(true);
        }
    });

    worker.run().await?;
    orchestrator.shutdown().await;
    Ok(())
}

async fn inspect_dlq(config: Config, args: DlqArgs) -> Result<()> {
    let orchestrator = build_orchestrator(config);
    orchestrator.start();

    let bus = orchestrator.bus();
    let dead_letters = bus.dead_letters();
    if dead_letters.is_empty() {
        println!("dead-letter queue is empty");
    }
    for event in &dead_letters {
        println!(
            "{}  {}  retries={}  source={}",
            event.event_id, event.event_type, event.retry_count, event.source
        );
    }

    if args.retry && !dead_letters.is_empty() {
        let count = bus.retry_dead_letters(None).await?;
        println!("re-published {count} events");
    }

    orchestrator.shutdown().await;
    Ok(())
}
