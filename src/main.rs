//! Cadence CLI
//!
//! Usage:
//!   cadence run workflow.toml      # Run a workflow (resumes a matching session)
//!   cadence resume <session>       # Resume a stored session
//!   cadence validate workflow.toml # Check a definition without running it
//!   cadence sessions list          # List stored sessions
//!   cadence adapters               # Show configured adapters

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cadence::host::{ConsoleHost, SignalHandler};
use cadence::process::SystemSpawner;
use cadence::workflow::RunnerOptions;
use cadence::{
    AdapterRegistry, Catalog, Config, Result, SessionStore, TaskRunner, WorkflowDefinition,
    WorkflowExecutor,
};

#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about = "Staged, resumable orchestration of CLI agents")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow definition (TOML, YAML or JSON)
    Run {
        /// Workflow definition file
        workflow: PathBuf,

        /// Answer detected prompts through adapter policies
        #[arg(long, env = "CADENCE_AUTO_APPROVE")]
        auto_approve: bool,

        /// Session id (defaults to the workflow id)
        #[arg(short, long)]
        session: Option<String>,

        /// Hide task output, show only status changes and prompts
        #[arg(short, long)]
        quiet: bool,
    },

    /// Resume a stored session from its last completed stage
    Resume {
        /// Session id
        session: String,

        /// Answer detected prompts through adapter policies
        #[arg(long, env = "CADENCE_AUTO_APPROVE")]
        auto_approve: bool,

        /// Hide task output
        #[arg(short, long)]
        quiet: bool,
    },

    /// Validate a workflow definition against the adapter catalog
    Validate {
        /// Workflow definition file
        workflow: PathBuf,
    },

    /// Stored sessions
    Sessions {
        #[command(subcommand)]
        action: SessionCommands,
    },

    /// List configured adapters
    Adapters,

    /// Write a default config file
    Init {
        /// Directory to create the config in
        #[arg(long, default_value = ".cadence")]
        dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List sessions, newest first
    List {
        /// Show only the N most recent
        #[arg(short, long, default_value = "20")]
        last: usize,
    },

    /// Show a session summary
    Show {
        /// Session id
        id: String,

        /// Print the full snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a session snapshot
    Rm {
        /// Session id
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if let Commands::Init { dir } = &cli.command {
        let path = cadence::config::init(dir)?;
        println!("Config written to {}", path.display());
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            workflow,
            auto_approve,
            session,
            quiet,
        } => {
            let definition = WorkflowDefinition::load(&workflow)?;
            let session_id = session.unwrap_or_else(|| definition.id.clone());
            let executor = build_executor(&config, auto_approve)?;
            run_with_host(&executor, !quiet, executor.execute_as(definition, &session_id)).await?;
        }

        Commands::Resume {
            session,
            auto_approve,
            quiet,
        } => {
            let executor = build_executor(&config, auto_approve)?;
            run_with_host(&executor, !quiet, executor.resume(&session)).await?;
        }

        Commands::Validate { workflow } => {
            let definition = WorkflowDefinition::load(&workflow)?;
            let executor = build_executor(&config, false)?;
            executor.validate(&definition)?;
            let tasks = definition.tasks().count();
            println!(
                "✓ {} is valid: {} stage(s), {} task(s)",
                definition.id,
                definition.stages.len(),
                tasks
            );
        }

        Commands::Sessions { action } => handle_sessions_command(action, &config)?,

        Commands::Adapters => {
            let catalog = build_catalog(&config)?;
            let registry = AdapterRegistry::from_catalog(&catalog);
            for (name, spec) in catalog.iter() {
                let modes = if spec.modes.is_empty() {
                    "all".to_string()
                } else {
                    let modes: Vec<String> = spec.modes.iter().map(|m| m.to_string()).collect();
                    modes.join(", ")
                };
                println!(
                    "{:<12} {:<28} {} pattern(s), modes: {}",
                    name,
                    spec.command,
                    spec.patterns.len(),
                    modes
                );
                for message in registry.pattern_errors(name) {
                    println!("  ! {}", message);
                }
            }
        }

        Commands::Init { .. } => {}
    }

    Ok(())
}

/// Built-in adapters, then the external catalog file, then inline config entries
fn build_catalog(config: &Config) -> Result<Catalog> {
    let mut catalog = Catalog::builtin();
    if let Some(path) = &config.catalog.path {
        let path = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref());
        catalog.merge(Catalog::load(&path)?);
    }
    catalog.extend(config.adapters.clone());
    Ok(catalog)
}

fn build_executor(config: &Config, auto_approve: bool) -> Result<WorkflowExecutor> {
    let catalog = build_catalog(config)?;
    let mut options = RunnerOptions::from_config(config);
    options.auto_approve |= auto_approve;

    let runner = TaskRunner::new(
        AdapterRegistry::from_catalog(&catalog),
        Arc::new(SystemSpawner::new(&config.process)),
        SessionStore::from_config(config),
        options,
    );
    Ok(WorkflowExecutor::new(runner))
}

/// Drive a workflow with the console host attached and Ctrl+C wired to shutdown
async fn run_with_host(
    executor: &WorkflowExecutor,
    show_output: bool,
    run: impl std::future::Future<Output = Result<cadence::Session>>,
) -> Result<()> {
    let runner = executor.runner().clone();
    let (stop_host, host_stopped) = oneshot::channel();
    let host = tokio::spawn(
        ConsoleHost::new(runner.clone(), show_output).run(runner.subscribe(), host_stopped),
    );

    let signals = SignalHandler::new();
    signals.install(runner.clone())?;

    let result = run.await;
    runner.shutdown().await;
    let _ = stop_host.send(());
    if let Err(e) = host.await {
        warn!("Console host ended abnormally: {}", e);
    }

    match result {
        Ok(session) => {
            println!("\n{}", session.summary());
            Ok(())
        }
        Err(e) => {
            if let Some(session) = runner.session().await {
                println!("\n{}", session.summary());
            }
            if signals.is_interrupted() {
                warn!("Interrupted; resume with `cadence resume <session>`");
            }
            Err(e)
        }
    }
}

fn handle_sessions_command(action: SessionCommands, config: &Config) -> Result<()> {
    let store = SessionStore::from_config(config);

    match action {
        SessionCommands::List { last } => {
            let sessions = store.list()?;
            if sessions.is_empty() {
                println!("No sessions in {}", store.dir().display());
            }
            for session in sessions.into_iter().take(last) {
                let done = session
                    .task_status
                    .values()
                    .filter(|s| **s == cadence::TaskStatus::Done)
                    .count();
                println!(
                    "{} | stage {} | {}/{} done | {}",
                    session.id,
                    session.current_stage_index,
                    done,
                    session.task_status.len(),
                    session.start_time.format("%Y-%m-%d %H:%M")
                );
            }
        }

        SessionCommands::Show { id, json } => {
            let session = store.load(&id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&session)?);
            } else {
                println!("{}", session.summary());
            }
        }

        SessionCommands::Rm { id } => {
            store.delete(&id)?;
            info!("Deleted session {}", id);
        }
    }

    Ok(())
}
