use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "shipwright")]
#[command(version, about = "Phase orchestration engine for sandboxed app pipelines")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new shipwright project
    Init {
        /// Project name used in the plan template (defaults to the directory name)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Run the pipeline from its current stage until done or blocked
    Run {
        /// Plan file (defaults to .shipwright/plan.toml)
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Use in-memory tools; nothing touches disk or network
        #[arg(long)]
        dry_run: bool,

        /// Override the retry bound for this run
        #[arg(long)]
        retry_bound: Option<u32>,
    },
    /// Run a fix cycle against a QA artifact of a finished run
    Fix {
        /// QA findings file (JSON)
        #[arg(long)]
        qa: PathBuf,

        /// Plan file (defaults to .shipwright/plan.toml)
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Publish the fixes once the cycle is revalidated
        #[arg(long)]
        publish: bool,

        /// Continue the last dry run with in-memory tools
        #[arg(long)]
        dry_run: bool,

        /// Override the retry bound for this cycle
        #[arg(long)]
        retry_bound: Option<u32>,
    },
    /// Show the current run stage and history
    Status,
    /// Show recorded phase outcomes
    Report {
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check the sandbox's files against the layering rules
    Check,
    /// Check a path against the sandbox boundary
    ValidatePath { path: PathBuf },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Clear run state and outcome records
    Reset {
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any problems
    Validate,
    /// Initialize a default pipeline.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let log_dir = shipwright::init::shipwright_dir(&project_dir).join(shipwright::init::LOG_DIR);
    let _log_guard = shipwright::logging::init(cli.verbose, Some(&log_dir));

    let code = match &cli.command {
        Commands::Init { name } => {
            cmd::cmd_init(&project_dir, name.as_deref())?;
            ExitCode::SUCCESS
        }
        Commands::Run {
            plan,
            dry_run,
            retry_bound,
        } => {
            cmd::cmd_run(
                &project_dir,
                cli.verbose,
                plan.as_deref(),
                *dry_run,
                *retry_bound,
            )
            .await?
        }
        Commands::Fix {
            qa,
            plan,
            publish,
            dry_run,
            retry_bound,
        } => {
            cmd::cmd_fix(
                &project_dir,
                cli.verbose,
                plan.as_deref(),
                qa,
                *publish,
                *dry_run,
                *retry_bound,
            )
            .await?
        }
        Commands::Status => cmd::cmd_status(&project_dir)?,
        Commands::Report { json } => {
            cmd::cmd_report(&project_dir, *json)?;
            ExitCode::SUCCESS
        }
        Commands::Check => cmd::cmd_check(&project_dir).await?,
        Commands::ValidatePath { path } => cmd::cmd_validate_path(&project_dir, path)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
        Commands::Reset { force } => {
            cmd::cmd_reset(&project_dir, *force)?;
            ExitCode::SUCCESS
        }
    };

    Ok(code)
}
