//! FluidMCP - Local MCP Gateway
//!
//! Fronts a fleet of stdio MCP child processes and re-exposes each one over
//! HTTP, with per-package OAuth termination and managed LLM backends.

use clap::{Parser, Subcommand};
use fluidmcp::{registry, GatewayConfig};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "fluidmcp")]
#[command(about = "Local gateway for Model Context Protocol servers", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "FLUIDMCP_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Serve {
        /// Bind host
        #[arg(long, env = "FLUIDMCP_HOST", default_value = "127.0.0.1")]
        host: String,

        /// Bind port
        #[arg(long, env = "FLUIDMCP_PORT", default_value = "8099")]
        port: u16,

        /// Directory for the JSON document store; omit for in-memory only
        #[arg(long, env = "FLUIDMCP_STORE_PATH")]
        store_path: Option<PathBuf>,

        /// Public base URL for OAuth redirect URIs
        #[arg(long, env = "FLUIDMCP_PUBLIC_BASE_URL")]
        public_base_url: Option<String>,
    },

    /// Validate a server configuration document
    Validate {
        /// Path to a JSON file holding a server configuration
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Serve {
            host,
            port,
            store_path,
            public_base_url,
        } => {
            info!("FluidMCP v{} starting...", env!("CARGO_PKG_VERSION"));

            let mut config = GatewayConfig::from_env();
            config.host = host;
            config.port = port;
            if store_path.is_some() {
                config.store_path = store_path;
            }
            if public_base_url.is_some() {
                config.public_base_url = public_base_url;
            }

            let gateway = fluidmcp::Gateway::new(config).await?;
            gateway.run().await?;
        },

        Commands::Validate {
            config: config_path,
        } => {
            let bytes = std::fs::read(&config_path)?;
            let request: registry::CreateServer = serde_json::from_slice(&bytes)?;
            registry::validation::validate_server_id(&request.id)?;
            registry::validation::validate_command(&request.command)?;
            registry::validation::validate_env(&request.env)?;
            println!("configuration valid: {}", request.id);
        },
    }

    Ok(())
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
}
