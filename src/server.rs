//! TCP Server
//!
//! Binds the listener, picks the dispatcher for the configured [`Mode`], and
//! spawns one [`ConnectionHandler`](crate::connection::ConnectionHandler)
//! task per accepted client.

use crate::commands::Handler;
use crate::config::{ConfigError, Mode, ServerConfig};
use crate::connection::{handle_connection, ConnectionOptions, ConnectionStats, Dispatcher};
use crate::executor::{ExecutorError, OrderedExecutor};
use crate::protocol::banner;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Pause after a failed `accept` (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Errors from starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// A bound echo server.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    dispatcher: Dispatcher,
    executor: Option<Arc<OrderedExecutor>>,
    options: ConnectionOptions,
    stats: Arc<ConnectionStats>,
}

impl Server {
    /// Binds the listener and, in hsha mode, starts the worker pool.
    pub async fn bind(config: ServerConfig, handler: Arc<dyn Handler>) -> Result<Self, ServerError> {
        config.validate()?;

        let addr = config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let (dispatcher, executor, greeting_host) = match config.mode {
            Mode::Reactor => (Dispatcher::Inline(handler), None, None),
            Mode::Hsha => {
                let executor = Arc::new(OrderedExecutor::start(config.executor.clone(), handler)?);
                let hostname: Arc<str> = Arc::from(banner::local_hostname());
                (
                    Dispatcher::Pooled(Arc::clone(&executor)),
                    Some(executor),
                    Some(hostname),
                )
            }
        };

        let options = ConnectionOptions {
            max_line_length: config.max_line_length,
            idle_timeout: config.idle_timeout,
            greeting_host,
        };

        info!(address = %local_addr, mode = %config.mode, "Listening");

        Ok(Self {
            listener,
            local_addr,
            config,
            dispatcher,
            executor,
            options,
            stats: Arc::new(ConnectionStats::new()),
        })
    }

    /// The address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// The worker pool, in hsha mode.
    pub fn executor(&self) -> Option<&Arc<OrderedExecutor>> {
        self.executor.as_ref()
    }

    /// Accepts connections forever. Accept errors are logged and the loop
    /// keeps going.
    pub async fn run(&self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
                    }

                    tokio::spawn(handle_connection(
                        stream,
                        addr,
                        self.dispatcher.clone(),
                        self.options.clone(),
                        Arc::clone(&self.stats),
                    ));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Stops the worker pool and waits for its queued tasks to drain.
    pub async fn shutdown(&self) {
        let Some(executor) = self.executor.clone() else {
            return;
        };

        if let Err(e) = tokio::task::spawn_blocking(move || executor.shutdown()).await {
            error!(error = %e, "Worker pool shutdown failed");
        }
    }
}
