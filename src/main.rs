//! netsum: a point-to-point TCP throughput and correctness exerciser
//!
//! The client opens one or more connections and sends checksummed packets
//! of generated content. The server verifies each packet and echoes it back
//! with its bytes reversed; the client checks the reversal.
//!
//! Features:
//! - Length-prefixed framing with XXH64-checksummed packets
//! - Any number of independent client connections
//! - One-minute decayed throughput reporting on both ends
//! - Configuration via CLI arguments or TOML file

mod client;
mod config;
mod error;
mod framing;
mod packet;
mod server;
mod throughput;

use config::{Config, Mode};
use error::NetsumError;
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("netsum-worker")
        .build()?;

    let result = match config.mode {
        Mode::Client(client) => {
            info!(
                host = %client.host,
                port = client.port,
                threads = client.threads,
                packet_size = client.packet_size,
                "Starting netsum client"
            );
            runtime.block_on(client::run(client))
        }
        Mode::Server(server) => {
            info!(
                port = server.port,
                max_frame_size = server.max_frame_size,
                max_connections = ?server.max_connections,
                "Starting netsum server"
            );
            runtime.block_on(run_server(server))
        }
    };

    // Detached client workers must not hold up exit.
    runtime.shutdown_background();

    match result {
        Ok(()) => Ok(()),
        Err(NetsumError::Interrupted) => std::process::exit(1),
        Err(e) => Err(e.into()),
    }
}

/// Run the server until Ctrl-C or a fatal accept error.
async fn run_server(config: config::ServerConfig) -> error::Result<()> {
    let server = Server::new(config);
    let handle = server.handle();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, stopping server");
                handle.stop();
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    server.run().await
}
