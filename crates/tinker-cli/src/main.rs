//! The `tinker` binary: run LLM-driven code execution tasks from the
//! terminal.

mod display;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use display::ConsoleDisplay;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tinker_adapters::{OpenAiClient, PipInstaller};
use tinker_core::{EventLogger, TaskManager, TaskStatus, TinkerConfig};
use tinker_proto::{EventBus, PipelinePayload, TaskId};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tinker", version, about = "LLM task runner that writes and executes code")]
struct Cli {
    /// Path to a YAML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one task to completion.
    Run {
        /// The task instruction.
        instruction: Vec<String>,

        /// Override the configured round limit.
        #[arg(long)]
        max_rounds: Option<u32>,

        /// Seed the namespace from a finished task's snapshot.
        #[arg(long)]
        resume: Option<String>,

        /// Approve dependency installs without prompting.
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// List stored tasks.
    Tasks,
}

fn load_config(path: Option<&PathBuf>) -> Result<TinkerConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_yaml::from_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))
        }
        None => Ok(TinkerConfig::default()),
    }
}

/// Asks on the terminal whether missing packages may be installed.
fn attach_install_prompt(bus: &EventBus) {
    bus.subscribe_pipeline("install-prompt", |payload| match payload {
        PipelinePayload::InstallRequest {
            task_id, packages, ..
        } => {
            print!(
                "{} install missing packages [{}]? [y/N] ",
                "?".bold().yellow(),
                packages.join(", ")
            );
            let _ = std::io::stdout().flush();
            let mut answer = String::new();
            let approved = std::io::stdin().read_line(&mut answer).is_ok()
                && matches!(answer.trim().to_lowercase().as_str(), "y" | "yes");
            PipelinePayload::InstallRequest {
                task_id,
                packages,
                approved,
            }
        }
        other => other,
    });
}

async fn run_task(
    mut config: TinkerConfig,
    instruction: String,
    max_rounds: Option<u32>,
    resume: Option<String>,
    yes: bool,
) -> Result<()> {
    if let Some(max_rounds) = max_rounds {
        config.round_loop.max_rounds = max_rounds;
    }
    if yes {
        config.sandbox.auto_approve_installs = true;
    }

    let bus = Arc::new(EventBus::new());

    let display = ConsoleDisplay::new();
    display.attach(&bus);
    Arc::new(EventLogger::new(&config.store.state_dir)).attach(&bus);
    if !config.sandbox.auto_approve_installs {
        attach_install_prompt(&bus);
    }

    let client = Arc::new(OpenAiClient::from_config(&config.llm));
    let installer = Arc::new(PipInstaller::new(&config.sandbox.python_bin));
    let manager = TaskManager::new(config, bus, client).with_installer(installer);

    let id = match resume {
        Some(source) => manager
            .submit_resumed(instruction, &TaskId::from_string(source))
            .context("resuming from stored task")?,
        None => manager.submit(instruction),
    };

    let record = manager
        .wait(&id)
        .await
        .context("waiting for task completion")?;

    // The final answer is the commentary of the last round.
    if let Some(last) = record.rounds.last() {
        if !last.commentary.is_empty() {
            println!("\n{last}", last = last.commentary);
        }
    }
    println!(
        "{}",
        format!(
            "id: {} | rounds: {} | tokens: {}/{} | {}ms",
            record.id,
            record.stats.rounds,
            record.stats.input_tokens,
            record.stats.output_tokens,
            record.stats.elapsed_ms
        )
        .dimmed()
    );

    match record.status {
        TaskStatus::Done => Ok(()),
        TaskStatus::Cancelled => anyhow::bail!("task cancelled"),
        _ => anyhow::bail!(
            "task failed: {}",
            record.error.unwrap_or_else(|| "unknown error".into())
        ),
    }
}

fn list_tasks(config: &TinkerConfig) -> Result<()> {
    let store = tinker_core::TaskStore::new(&config.store.state_dir);
    let summaries = store.list().context("listing stored tasks")?;
    if summaries.is_empty() {
        println!("no stored tasks");
        return Ok(());
    }
    for summary in summaries {
        let status = match summary.status {
            TaskStatus::Done if summary.truncated => "done*".yellow().to_string(),
            TaskStatus::Done => "done".green().to_string(),
            TaskStatus::Cancelled => "cancelled".yellow().to_string(),
            other => other.as_str().red().to_string(),
        };
        println!(
            "{}  {}  {:>3} round(s)  {}  {}",
            summary.id,
            summary.created.format("%Y-%m-%d %H:%M"),
            summary.rounds,
            status,
            summary.instruction
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("TINKER_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Run {
            instruction,
            max_rounds,
            resume,
            yes,
        } => {
            let instruction = instruction.join(" ");
            anyhow::ensure!(!instruction.trim().is_empty(), "instruction is empty");
            run_task(config, instruction, max_rounds, resume, yes).await
        }
        Command::Tasks => list_tasks(&config),
    }
}
