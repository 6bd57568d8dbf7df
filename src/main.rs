//! Agentbridge - bridge a supervised coding agent to WebSocket clients

use agentbridge::{
    agent::launcher::resolve_agent_binary,
    config::{default_config_path, BridgeConfig},
    gateway::GatewayBuilder,
};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Parser)]
#[command(name = "agentbridge")]
#[command(version)]
#[command(about = "Supervised agent subprocess bridged to WebSocket subscribers")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "AGENTBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent and serve the gateway
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run diagnostics
    Doctor,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("agentbridge={},tower_http=debug", log_level).into());
    let fmt_layer = if cli.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    let config = BridgeConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            run_serve(config, host, port).await?;
        }
        Commands::Doctor => {
            run_doctor(&config, cli.config.as_deref());
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

async fn run_serve(config: BridgeConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut builder = GatewayBuilder::new().config(config);
    if let Some(host) = host {
        builder = builder.host(host);
    }
    if let Some(port) = port {
        builder = builder.port(port);
    }
    let gateway = builder.build();

    let addr = gateway.start().await?;

    tracing::info!(addr = %addr, "Agentbridge is running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    gateway.stop().await?;

    Ok(())
}

fn run_doctor(config: &BridgeConfig, explicit: Option<&std::path::Path>) {
    println!("Agentbridge Doctor");
    println!();

    println!("Checking agent executable...");
    match resolve_agent_binary(&config.agent.command) {
        Ok(path) => println!("  ✓ {} -> {}", config.agent.command, path.display()),
        Err(e) => println!("  ✗ {}", e),
    }

    println!();
    println!("Checking configuration...");
    match explicit.map(PathBuf::from).or_else(default_config_path) {
        Some(path) if path.exists() => {
            println!("  ✓ Configuration file found: {}", path.display());
        }
        Some(path) => {
            println!("  ℹ No configuration file at {} (using defaults)", path.display());
        }
        None => println!("  ℹ No configuration directory (using defaults)"),
    }

    println!();
    println!("Doctor check complete!");
}

fn show_config(config: Option<&BridgeConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
