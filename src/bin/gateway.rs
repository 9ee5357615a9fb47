//! OpenGate gateway server
//!
//! Loads configuration, checks the mandatory security requirements and
//! serves the WebSocket control plane until interrupted.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use opengate::config::{apply_env_overrides, load_config, load_config_from_path};
use opengate::gateway::GatewayServer;
use opengate::{Error, VERSION};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "opengate-gateway", version = VERSION, about = "OpenGate WebSocket control plane")]
struct Args {
    /// Config file (json5 or toml); defaults to the standard config location
    #[arg(long, short, env = "OPENGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Port override
    #[arg(long, short)]
    port: Option<u16>,

    /// Bind address override
    #[arg(long)]
    bind: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive("opengate=debug".parse()?);
    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }

    let mut config = match &args.config {
        Some(path) => {
            dotenvy::dotenv().ok();
            let mut config = load_config_from_path(path)?;
            apply_env_overrides(&mut config, |key| std::env::var(key).ok());
            config
        }
        None => load_config()?,
    };
    if let Some(port) = args.port {
        config.gateway.port = port;
    }
    if let Some(bind) = args.bind {
        config.gateway.bind = bind;
    }

    let server = match GatewayServer::bind(&config).await {
        Ok(server) => server,
        Err(Error::SecurityValidation(report)) => {
            eprintln!("{}", report);
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    info!(version = VERSION, addr = %server.local_addr()?, "OpenGate gateway started");

    server
        .serve_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
