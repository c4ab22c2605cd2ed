mod config;
mod logging;
mod signals;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use axum::Router;
use clap::{Parser, Subcommand};
use service_registry::ServiceRegistryModule;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;

/// Service Registry - discovery and health tracking for agents and tools
#[derive(Parser)]
#[command(name = "registry-server")]
#[command(about = "Service Registry - discovery and health tracking for agents and tools")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port override for HTTP server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Run,
    /// Validate configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(ref path) = cli.config
        && !Path::new(path).is_file()
    {
        anyhow::bail!("config file does not exist: {}", path.to_string_lossy());
    }

    // 1) defaults -> 2) YAML -> 3) legacy env -> 4) REGISTRY__* env -> 5) CLI
    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_cli_overrides(cli.port, cli.verbose);

    if cli.print_config {
        println!("Effective configuration:\n{}", config.to_yaml()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(&config).await,
        Commands::Check => check_config(&config),
    }
}

fn check_config(config: &AppConfig) -> Result<()> {
    config.validate()?;
    println!("Configuration is valid");
    println!("{}", config.to_yaml()?);
    Ok(())
}

async fn run_server(config: &AppConfig) -> Result<()> {
    config.validate()?;
    logging::init_logging(&config.logging)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Service registry starting");

    let module = ServiceRegistryModule::init(&config.coordination, &config.registry)?;
    module.start().await?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = module
        .register_rest(Router::new())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = config.server.bind_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            module.stop().await;
            return Err(e).with_context(|| format!("failed to bind {addr}"));
        }
    };
    tracing::info!(%addr, "HTTP server listening");

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = signals::wait_for_shutdown().await {
            tracing::error!(error = %e, "Signal handling failed");
        }
        signal_cancel.cancel();
    });

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled_owned().await })
        .await;

    module.stop().await;
    tracing::info!("Service registry stopped");
    served.context("HTTP server failed")
}
