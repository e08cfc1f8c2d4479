//! CLI for mqtt-core-broker
//!
//! Subcommands:
//! - `server`: run the broker behind the WebSocket transport

use std::sync::Arc;

use clap::Parser;
use mqtt_core_broker::broker::BrokerEngine;
use mqtt_core_broker::config::load_config_from;
use mqtt_core_broker::persistence::open_store;
use mqtt_core_broker::transport::start_websocket_server;
use mqtt_core_broker::utils::{Result, logging};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "mqtt-core-broker")]
enum Command {
    /// Start the broker
    Server {
        /// Configuration file (default: config/default, optional)
        #[arg(long)]
        config: Option<String>,
        /// Log level: error, warn, info, debug or trace (RUST_LOG overrides it)
        #[arg(long, default_value = "info")]
        log_level: String,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    match Command::parse() {
        Command::Server { config, log_level } => {
            logging::init(&log_level);
            if let Err(e) = run_server(config.as_deref()).await {
                error!("Server failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn run_server(config_path: Option<&str>) -> Result<()> {
    let settings = load_config_from(config_path)?;
    let engine = Arc::new(BrokerEngine::from_settings(&settings)?);
    let store = open_store(&settings.persistence)?;
    info!("Starting broker with {:?}", engine.config());

    tokio::select! {
        result = start_websocket_server(settings, engine, store) => {
            result?;
            error!("WebSocket server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    Ok(())
}
