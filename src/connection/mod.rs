//! Connection Handler Module
//!
//! This module manages individual client connections to the echo server.
//! Each client connection is handled by its own async task; in hsha mode the
//! line handling itself is handed to the worker pool.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                    (server.rs)                              │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ accept()
//!                        ▼
//!           ┌────────────────────────┐
//!           │   For each client...   │
//!           └────────────┬───────────┘
//!                        │
//!                        │ spawn task
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────────┐  │
//! │  │ Read bytes  │───>│ Decode line │───>│ Dispatch        │  │
//! │  └─────────────┘    └─────────────┘    │ inline | pooled │  │
//! │                                        └────────┬────────┘  │
//! │                                                 ▼           │
//! │                                        ┌─────────────────┐  │
//! │                                        │ Write reply     │  │
//! │                                        └─────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Ordering**: replies leave in the order their lines arrived
//! - **Back-pressure**: reads pause while the worker pool is saturated
//! - **Orderly close**: `bye`, oversized lines and idle timeouts cancel
//!   whatever the connection still has queued
//! - **Statistics**: tracks connection and line metrics
//!
//! ## Example
//!
//! ```ignore
//! use hsha_echo::commands::EchoHandler;
//! use hsha_echo::connection::{handle_connection, ConnectionOptions, ConnectionStats, Dispatcher};
//! use std::sync::Arc;
//!
//! let dispatcher = Dispatcher::Inline(Arc::new(EchoHandler::new()));
//! let stats = Arc::new(ConnectionStats::new());
//!
//! // For each accepted connection...
//! let (stream, addr) = listener.accept().await?;
//! tokio::spawn(handle_connection(
//!     stream,
//!     addr,
//!     dispatcher.clone(),
//!     ConnectionOptions::default(),
//!     Arc::clone(&stats),
//! ));
//! ```

pub mod handler;
pub mod session;

// Re-export commonly used types
pub use handler::{
    handle_connection, CloseReason, ConnectionError, ConnectionHandler, ConnectionOptions,
    ConnectionStats, Dispatcher,
};
pub use session::{ConnectionId, ConnectionState, Session};
