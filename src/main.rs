//! hsha-echo - A Line-Delimited TCP Echo Server
//!
//! This is the main entry point. It parses the command line, sets up
//! logging, and runs the server until Ctrl+C.

use clap::Parser;
use hsha_echo::{Cli, EchoHandler, Mode, Server, ServerConfig};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn print_banner(config: &ServerConfig, addr: SocketAddr) {
    let model = match config.mode {
        Mode::Reactor => "reactor (handlers run on the I/O tasks)".to_string(),
        Mode::Hsha => format!(
            "half-sync/half-async ({} workers, {} queued tasks max)",
            config.executor.workers, config.executor.max_queued_tasks
        ),
    };

    println!(
        r#"
hsha-echo v{} - Line-Delimited TCP Echo Server
──────────────────────────────────────────────────────────────
Listening on {}
Execution model: {}
Ready to accept connections.

Send "bye" to close a connection. Use Ctrl+C to shutdown gracefully.
"#,
        hsha_echo::VERSION,
        addr,
        model
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = ServerConfig::try_from(Cli::parse())?;

    // Set up logging (RUST_LOG overrides the default level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let server = Server::bind(config.clone(), Arc::new(EchoHandler::new())).await?;

    // Print the banner
    print_banner(&config, server.local_addr());

    // Set up graceful shutdown
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
    };

    // Main accept loop
    tokio::select! {
        _ = server.run() => {}
        _ = shutdown => {}
    }

    server.shutdown().await;

    let stats = server.stats();
    info!(
        connections = stats.connections_accepted.load(Ordering::Relaxed),
        lines = stats.lines_received.load(Ordering::Relaxed),
        "Server shutdown complete"
    );
    Ok(())
}
