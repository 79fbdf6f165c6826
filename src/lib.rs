//! # hsha-echo - A Line-Delimited TCP Echo Server
//!
//! hsha-echo serves a line-oriented echo protocol over TCP with one of two
//! execution models, picked at startup:
//!
//! - **Reactor**: every line is handled inline on the connection's async task.
//! - **Half-sync/half-async (hsha)**: connection tasks only do I/O; lines are
//!   handed to a fixed pool of worker threads that may block freely.
//!
//! ## Features
//!
//! - **Per-connection ordering**: replies are written in the order their
//!   lines arrived, even with many workers
//! - **Bounded queueing**: the pool limits outstanding tasks, their total
//!   size, and the size held by any one connection
//! - **Back-pressure**: a connection stops reading while the pool is full
//! - **Failure isolation**: a failing or panicking handler costs one line,
//!   not the connection or the worker
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              hsha-echo                                  │
//! │                                                                         │
//! │  ┌─────────────┐    ┌──────────────────┐    ┌─────────────┐             │
//! │  │   Server    │───>│ ConnectionHandler│───>│  LineCodec  │             │
//! │  │ (Listener)  │    │  (one per conn)  │    │  (framing)  │             │
//! │  └─────────────┘    └────────┬─────────┘    └─────────────┘             │
//! │                              │                                          │
//! │               reactor        │        hsha                              │
//! │            ┌─────────────────┴──────────────────┐                       │
//! │            ▼                                    ▼                       │
//! │   ┌─────────────────┐        ┌──────────────────────────────────────┐   │
//! │   │ Handler (inline)│        │          OrderedExecutor             │   │
//! │   └─────────────────┘        │  ┌────────┐ ┌────────┐ ┌────────┐    │   │
//! │                              │  │Worker 0│ │Worker 1│ │...N    │    │   │
//! │                              │  └────────┘ └────────┘ └────────┘    │   │
//! │                              └──────────────────┬───────────────────┘   │
//! │                                                 │ Completion            │
//! │                                                 ▼                       │
//! │                                   back to the ConnectionHandler         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use hsha_echo::{EchoHandler, Server, ServerConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::bind(ServerConfig::default(), Arc::new(EchoHandler::new())).await?;
//!
//!     tokio::select! {
//!         _ = server.run() => {}
//!         _ = tokio::signal::ctrl_c() => {}
//!     }
//!
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Protocol
//!
//! - Lines end with CR, LF or CRLF and are at most 8192 bytes long
//! - Every line is echoed back followed by `\n`
//! - `bye` in any letter case closes the connection without a reply
//! - In hsha mode the server greets with `Welcome to {host}!` and the
//!   current local time
//!
//! ## Module Overview
//!
//! - [`protocol`]: line codec and connect banner
//! - [`commands`]: the `Handler` trait and the echo logic
//! - [`executor`]: the ordered, bounded worker pool
//! - [`connection`]: per-connection state machine and dispatch
//! - [`config`]: command line and validated settings
//! - [`server`]: listener and accept loop

pub mod commands;
pub mod config;
pub mod connection;
pub mod executor;
pub mod protocol;
pub mod server;

// Re-export commonly used types for convenience
pub use commands::{EchoHandler, Handler, Reply};
pub use config::{Cli, ExecutorConfig, Mode, ServerConfig, DEFAULT_HOST, DEFAULT_PORT};
pub use connection::{handle_connection, ConnectionStats};
pub use executor::{OrderedExecutor, SubmitError};
pub use protocol::{FrameError, LineCodec};
pub use server::{Server, ServerError};

/// Version of hsha-echo
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
