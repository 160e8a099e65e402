//! Axon Worker - serves registered APIs and listeners until terminated.
//!
//! Implements the `run` contract: load configuration, start a bus client
//! on it, serve until SIGINT/SIGTERM, stop gracefully.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `AXON_CONFIG`: Path to the TOML configuration (default: "config/axon.toml")
//! - `REDIS_URL`: Referenced from the config file via `${REDIS_URL}`
//! - `AXON_WORKER_NAME`: Unique worker identifier (default: hostname or UUID)
//! - `RUST_LOG`: Logging level (default: "info")
//!
//! ## Exit codes
//!
//! - 0: normal stop
//! - 1: configuration error
//! - 2: transport failure at startup
//! - 130: interrupted

use std::env;
use std::process::ExitCode;

use tracing::{error, info};

use axon::client::BusClient;
use axon::config::BusConfig;
use axon::error::BusError;
use axon::shutdown::ShutdownSignal;

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_TRANSPORT: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let mut config = match BusConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if config.worker.name.is_none() {
        if let Ok(name) = env::var("AXON_WORKER_NAME") {
            config.worker.name = Some(name);
        }
    }

    let client = match BusClient::from_config(config) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to build bus client");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    axon::set_bus(client.clone());

    info!("Axon worker starting");
    if let Err(e) = client.start().await {
        error!(error = %e, "Startup failed");
        return ExitCode::from(match e {
            BusError::Configuration(_) => EXIT_CONFIG,
            _ => EXIT_TRANSPORT,
        });
    }

    let shutdown = ShutdownSignal::new();
    shutdown.wait_for_signal().await;

    if let Err(e) = client.stop().await {
        // Shutdown-time errors are logged, never fatal to the stop sequence.
        error!(error = %e, "Error during shutdown");
    } else {
        info!("Axon worker stopped");
    }

    // A signal-initiated stop exits 130 by convention; a programmatic stop
    // would exit 0.
    if shutdown.is_triggered() {
        ExitCode::from(EXIT_INTERRUPTED)
    } else {
        ExitCode::from(EXIT_OK)
    }
}
