//! Meridian: control plane for the hub fabric
//!
//! `control` runs a Coordinator replica, `hub` runs a hub against one,
//! `dev` runs both in one process with throwaway credentials.

mod control;
mod dev;
mod hub;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "meridian")]
#[command(about = "Meridian - coordinator and hub agent for the tunnel fabric")]
#[command(version = env!("MERIDIAN_VERSION"))]
struct Cli {
    /// Log filter, e.g. `info` or `meridian_cert=debug`
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a Coordinator replica
    Control(control::ControlArgs),

    /// Run a hub against a Coordinator
    Hub(hub::HubArgs),

    /// Coordinator and hub in one process with self-signed TLS
    Dev(dev::DevArgs),

    /// Apply database migrations and exit
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}

fn setup_logging(log_level: &str) {
    // DEBUG=1 overrides everything else, then RUST_LOG, then --log-level
    let debug = std::env::var("DEBUG").is_ok_and(|v| !v.is_empty() && v != "0");
    let filter = if debug {
        EnvFilter::new("trace")
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// First Ctrl-C cancels `shutdown`; a second one cancels `force`.
fn shutdown_signals() -> (CancellationToken, CancellationToken) {
    let shutdown = CancellationToken::new();
    let force = CancellationToken::new();

    {
        let shutdown = shutdown.clone();
        let force = force.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                return;
            }
            info!("Shutting down, press Ctrl-C again to force");
            shutdown.cancel();

            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Forcing shutdown");
                force.cancel();
            }
        });
    }

    (shutdown, force)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);
    info!(version = env!("MERIDIAN_VERSION"), "Meridian starting");

    match cli.command {
        Commands::Migrate { database_url } => {
            let db = meridian_store::connect(&database_url)
                .await
                .context("Failed to connect to database")?;
            meridian_store::migrate(&db)
                .await
                .context("Failed to run migrations")?;
            info!("Migrations applied");
            Ok(())
        }
        Commands::Control(args) => {
            let (shutdown, force) = shutdown_signals();
            control::run(args, shutdown, force).await
        }
        Commands::Hub(args) => {
            let (shutdown, force) = shutdown_signals();
            hub::run(args, shutdown, force).await
        }
        Commands::Dev(args) => {
            let (shutdown, force) = shutdown_signals();
            dev::run(args, shutdown, force).await
        }
    }
}
