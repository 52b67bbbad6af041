//! nbflow CLI
//!
//! Runs a planner-driven notebook workflow against an HTTP gateway.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nbflow::workflow::{RunOutcome, StartMode, WorkflowController, WorkflowSession};
use nbflow::{Config, HttpGateway, ProcessExecutor};

#[derive(Parser)]
#[command(name = "nbflow")]
#[command(author, version, about = "Planner-driven notebook workflows")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow for a problem statement
    Run {
        /// Problem statement, stored as the `user_problem` variable
        #[arg(long, short)]
        problem: String,

        /// Maximum dispatched actions (0 = unbounded)
        #[arg(long)]
        max_steps: Option<u64>,

        /// Let the planner skip steps it considers already achieved
        #[arg(long)]
        reflection: bool,

        /// Pause at the step ceiling and wait for Enter
        #[arg(long, short)]
        interactive: bool,

        /// Gateway base URL
        #[arg(long, env = "NBFLOW_BASE_URL")]
        base_url: Option<String>,

        /// Interpreter command for code cells, e.g. "python3 -c"
        #[arg(long)]
        executor: Option<String>,
    },

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load config
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load config")?;

    match cli.command {
        Commands::Run {
            problem,
            max_steps,
            reflection,
            interactive,
            base_url,
            executor,
        } => {
            if let Some(max_steps) = max_steps {
                config.execution.max_steps = max_steps;
            }
            if reflection {
                config.execution.start_mode = StartMode::Reflection;
            }
            if interactive {
                config.execution.interactive = true;
            }
            if let Some(base_url) = base_url {
                config.gateway.base_url = base_url;
            }
            if executor.is_some() {
                config.executor.command = executor;
            }
            config.validate()?;

            run_workflow(&config, problem).await?;
        }

        Commands::Config => {
            println!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

async fn run_workflow(config: &Config, problem: String) -> anyhow::Result<()> {
    let gateway = HttpGateway::new(&config.gateway)?;

    let mut variables = HashMap::new();
    variables.insert("user_problem".to_string(), Value::String(problem));

    let mut controller =
        WorkflowController::new(WorkflowSession::with_variables(variables), Arc::new(gateway))
            .with_retry_policy(config.retry_policy()?)
            .with_control(config.execution_control())
            .with_custom_context(config.context.clone());

    if let Some(executor) = ProcessExecutor::from_config(&config.executor)? {
        info!("Executing code with {}", config.executor.command.as_deref().unwrap_or(""));
        controller = controller.with_executor(Arc::new(executor));
    }

    let pause = controller.pause_handle();
    pause.install_ctrlc()?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut quit_check = tokio::time::interval(Duration::from_millis(200));

    let outcome = 'run: loop {
        match controller.run().await {
            RunOutcome::Paused => {
                let status = controller.execution_status();
                println!(
                    "Paused in {} after {} actions. Press Enter to resume.",
                    status.state, status.step_counter
                );
                loop {
                    if pause.quit_requested() {
                        break 'run RunOutcome::Paused;
                    }
                    tokio::select! {
                        line = stdin.next_line() => match line? {
                            Some(_) => break,
                            None => break 'run RunOutcome::Paused,
                        },
                        _ = quit_check.tick() => {}
                    }
                }
                controller.resume();
            }
            outcome => break outcome,
        }
    };

    print_notebook(&controller);

    let status = controller.execution_status();
    println!();
    println!("State:   {}", status.state);
    println!("Actions: {}", status.step_counter);
    if let Some(stage) = status.position.stage_id {
        println!("Stage:   {}", stage);
    }

    match outcome {
        RunOutcome::Completed => println!("Workflow completed"),
        RunOutcome::StepLimitReached => println!("Stopped at the step ceiling"),
        RunOutcome::Paused if pause.quit_requested() => {
            println!("Interrupted");
            std::process::exit(130);
        }
        RunOutcome::Paused => println!("Stopped while paused"),
        RunOutcome::Failed { message } => bail!("Workflow failed: {}", message),
    }

    Ok(())
}

fn print_notebook(controller: &WorkflowController) {
    for cell in controller.session().notebook.cells() {
        println!("── {} [{}] ──", cell.id, cell.cell_type);
        println!("{}", cell.content);
        for output in &cell.outputs {
            let text = match &output.payload {
                Value::String(s) => s.clone(),
                Value::Object(obj) => obj
                    .get("text")
                    .and_then(|t| t.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| output.payload.to_string()),
                other => other.to_string(),
            };
            let mark = if output.success { "→" } else { "✗" };
            println!("{} {}", mark, text);
        }
    }
}
