use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "pipeline")]
#[command(version, about = "Quality-remediation orchestrator")]
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
    /// Create .pipeline/ with a default pipeline.toml
    Init,
    /// Start a new remediation session
    Run {
        /// Maximum fix/validate cycles (overrides pipeline.toml)
        #[arg(long)]
        max_cycles: Option<u32>,
        /// Remaining-issue count that counts as done (overrides pipeline.toml)
        #[arg(long)]
        target_issues: Option<usize>,
    },
    /// Show a session's progress (latest if omitted)
    Status {
        #[arg(long)]
        session: Option<String>,
        /// Print the session report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resume an interrupted session from its checkpoint
    Resume {
        #[arg(long)]
        session: String,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Manage protection of the pipeline's own control files
    Protect {
        /// Read the administrative credential from stdin
        #[arg(long, global = true)]
        credential_stdin: bool,

        #[command(subcommand)]
        command: ProtectCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[derive(Subcommand, Clone)]
pub enum ProtectCommands {
    /// Protect files matching the patterns (defaults to [protection].files)
    Setup { patterns: Vec<String> },
    /// Show protected files and their state
    Status,
    /// Verify hashes; exits 2 on drift
    Check,
    /// Restore drifted files (or FILE) from verified backups
    Restore { file: Option<PathBuf> },
    /// Stop protecting FILEs (all if none given)
    Unprotect { files: Vec<PathBuf> },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(&cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", console::style("Error:").red().bold(), e);
            ExitCode::from(2)
        }
    }
}

async fn dispatch(cli: &Cli) -> Result<u8> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let _telemetry = cmd::init_logging(&project_dir, cli.verbose);

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir).map(|_| 0),
        Commands::Run {
            max_cycles,
            target_issues,
        } => cmd::cmd_run(&project_dir, cli.verbose, *max_cycles, *target_issues).await,
        Commands::Status { session, json } => {
            cmd::cmd_status(&project_dir, session.as_deref(), *json).map(|_| 0)
        }
        Commands::Resume { session } => cmd::cmd_resume(&project_dir, cli.verbose, session).await,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone()).map(|_| 0),
        Commands::Protect {
            credential_stdin,
            command,
        } => cmd::cmd_protect(&project_dir, command.clone(), *credential_stdin).await,
    }
}
