mod agent;
mod check;
mod system;

use anyhow::Result;
use clap::{Parser, Subcommand};
use keeper_common::config::PlatformChoice;
use std::path::PathBuf;
use std::process::ExitCode;

const DEFAULT_CONFIG_PATH: &str = r"C:\ProgramData\sc-keeper\keeper.toml";

#[derive(Parser)]
#[command(name = "sc-keeper")]
#[command(about = "Check and repair the ScreenConnect agent, reporting to the RMM platform")]
struct Args {
    /// Configuration file; a missing default file means defaults plus flags
    #[arg(long)]
    config: Option<PathBuf>,

    /// Full agent service name, e.g. "ScreenConnect Client (0123456789abcdef)"
    #[arg(long)]
    service_name: Option<String>,

    /// ScreenConnect server host name
    #[arg(long)]
    domain: Option<String>,

    /// Company name sent with the installer
    #[arg(long)]
    company: Option<String>,

    /// Site name sent with the installer
    #[arg(long)]
    site: Option<String>,

    /// RMM field that receives the join URL
    #[arg(long)]
    url_field: Option<String>,

    /// Do not write the join URL to the RMM
    #[arg(long)]
    no_url: bool,

    /// RMM platform, detected from the environment by default
    #[arg(long, value_enum)]
    platform: Option<PlatformChoice>,

    /// Seconds to wait after each repair step
    #[arg(long)]
    settle_seconds: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full check-and-repair pass and report to the RMM
    Check {
        /// Print the run report as JSON instead of RMM output
        #[arg(long)]
        json: bool,
    },
    /// Show service state, installed version and join URL
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Download and install the agent now
    Install,
    /// Force remove the agent service, package and files
    Remove,
    /// Print the join URL
    Url {
        /// Also write it to the configured RMM field
        #[arg(long)]
        publish: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    // stdout carries RMM result markers
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let args = Args::parse();

    let config = system::load_config(&args).await?;

    match args.command {
        Commands::Check { json } => check::handle_check_command(&config, json).await,
        Commands::Status { json } => {
            agent::status_agent(&config, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Install => agent::install_agent(&config).await,
        Commands::Remove => agent::remove_agent(&config).await,
        Commands::Url { publish } => {
            agent::print_join_url(&config, publish)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
