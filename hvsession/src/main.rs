mod cli;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cli::Transition;

#[derive(Parser)]
#[command(name = "hvsession", about = "VirtualBox session manager")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SessionArgs {
    /// Session identifier; names the local state file and the machine.
    id: String,
    /// Path to config file (TOML).
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Session parameter as key=value (repeatable), e.g. --param cpus=2.
    #[arg(long = "param", short = 'p', value_parser = cli::parse_pair)]
    params: Vec<(String, String)>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the machine if needed and boot it.
    Start {
        #[command(flatten)]
        session: SessionArgs,
        /// User data as key=value (repeatable), expanded into the context medium.
        #[arg(long = "data", short = 'd', value_parser = cli::parse_pair)]
        user_data: Vec<(String, String)>,
    },
    /// Power the machine off, keeping its disks.
    Stop {
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Pause a running machine.
    Pause {
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Resume a paused machine.
    Resume {
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Save the machine state to disk.
    Hibernate {
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Power off and delete the machine with all its media.
    Destroy {
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Change the CPU execution cap (1-100).
    ExecCap {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(value_parser = clap::value_parser!(u32).range(1..=100))]
        cap: u32,
    },
    /// Show persisted session state (the hypervisor is not queried).
    Status {
        /// Session to show; all sessions when omitted.
        id: Option<String>,
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Verify prerequisites. Exits 0 if all pass.
    Check {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let (session, transition, user_data) = match cli.command {
        Commands::Check { config } => {
            let config = cli::load_config(config)?;
            return cli::run_check(&config);
        }
        Commands::Status { id, config } => {
            let config = cli::load_config(config)?;
            return cli::run_status(&config, id.as_deref());
        }
        Commands::ExecCap { session, cap } => {
            let config = cli::load_config(session.config)?;
            return cli::run_execution_cap(config, &session.id, session.params, cap).await;
        }
        Commands::Start { session, user_data } => (session, Transition::Start, user_data),
        Commands::Stop { session } => (session, Transition::Stop, Vec::new()),
        Commands::Pause { session } => (session, Transition::Pause, Vec::new()),
        Commands::Resume { session } => (session, Transition::Resume, Vec::new()),
        Commands::Hibernate { session } => (session, Transition::Hibernate, Vec::new()),
        Commands::Destroy { session } => (session, Transition::Destroy, Vec::new()),
    };

    let config = cli::load_config(session.config)?;
    cli::run_transition(config, &session.id, session.params, user_data, transition).await
}
