//! hdeploy - apply a homelab manifest store to a cluster in dependency order.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use homelab_deploy::commands::apply::ApplyCommand;
use homelab_deploy::commands::check::CheckCommand;
use homelab_deploy::commands::plan::PlanCommand;
use homelab_deploy::commands::status::StatusCommand;
use homelab_deploy::commands::verify::VerifyCommand;
use homelab_deploy::commands::GlobalArgs;

/// Homelab manifest applier.
#[derive(Parser)]
#[command(
    name = "hdeploy",
    version,
    about = "Apply a homelab manifest store in dependency order",
    long_about = "Apply a homelab manifest store to a Kubernetes cluster.\n\n\
                  Units are applied one at a time in dependency order. The pass\n\
                  stops at the first rejected unit; nothing is retried or rolled\n\
                  back. Re-running after a fix is safe: unchanged units are no-ops."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the apply order and what would change.
    Plan(PlanCommand),

    /// Apply units in dependency order.
    Apply(ApplyCommand),

    /// Verify health of units applied by the last pass.
    Verify(VerifyCommand),

    /// Show the last recorded run.
    Status(StatusCommand),

    /// Check prerequisites and the manifest store.
    Check(CheckCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("info,homelab_deploy=debug")
        } else {
            EnvFilter::new("warn,homelab_deploy=info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Plan(cmd) => cmd.run(&cli.global).await,
        Commands::Apply(cmd) => cmd.run(&cli.global).await,
        Commands::Verify(cmd) => cmd.run(&cli.global).await,
        Commands::Status(cmd) => cmd.run(&cli.global).await,
        Commands::Check(cmd) => cmd.run(&cli.global).await,
    }
}
