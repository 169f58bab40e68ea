use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use cartograph_core::metrics::MetricsCollector;
use cartograph_server::{AppState, commands};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cartograph")]
#[command(about = "Discovers infrastructure resources and the relations between them")]
struct Cli {
    /// Path to the YAML configuration
    #[arg(
        short,
        long,
        global = true,
        env = "CARTOGRAPH_CONFIG",
        default_value = "config.yaml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run every source once and persist what it finds
    Discover,
    /// Apply the configured relation criteria
    Relation,
    /// Check the configuration and exit
    Validate,
    /// Run sources on their schedules until interrupted
    Schedule {
        /// Run every source once in dependency order, then exit
        #[arg(long)]
        once: bool,
    },
    /// Serve the query API
    Serve {
        #[arg(long, env = "CARTOGRAPH_ADDR", default_value = "0.0.0.0:8080")]
        addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = commands::load_config(&cli.config)?;

    if let Command::Validate = cli.command {
        println!("configuration {} is valid", cli.config.display());
        return Ok(());
    }

    let metrics = Arc::new(MetricsCollector::new());
    let storage = commands::connect_storage(&config).await?;

    match cli.command {
        Command::Validate => Ok(()),
        Command::Discover => {
            commands::discover(&config, storage, metrics).await?;
            Ok(())
        }
        Command::Relation => {
            commands::relate(&config, storage, metrics).await?;
            Ok(())
        }
        Command::Schedule { once } => {
            let shutdown = shutdown_on_ctrl_c();
            commands::schedule(&config, storage, metrics, once, shutdown).await
        }
        Command::Serve { addr } => {
            let shutdown = shutdown_on_ctrl_c();
            commands::serve(addr, AppState::new(storage, metrics), shutdown).await
        }
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for interrupt");
            return;
        }
        info!("interrupt received, shutting down");
        trigger.cancel();
    });
    token
}
