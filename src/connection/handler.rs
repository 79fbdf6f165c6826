//! Connection Handler Module
//!
//! This module drives one client connection from accept to close. Each
//! connection runs in its own tokio task, reading lines through the
//! [`LineCodec`] and writing replies back through the same codec.
//!
//! ## Dispatch
//!
//! ```text
//!                   ┌──────────────────────────────┐
//!  socket ──bytes──>│ FramedRead<LineCodec>        │
//!                   └──────────────┬───────────────┘
//!                                  │ line
//!                 ┌────────────────┴────────────────┐
//!                 │ Inline                          │ Pooled
//!                 ▼                                 ▼
//!        handler.handle(line)             executor.submit(Task)
//!                 │                                 │  (worker thread)
//!                 │                                 ▼
//!                 │                       Completion over mpsc
//!                 ▼                                 ▼
//!                   ┌──────────────────────────────┐
//!  socket <─bytes───│ FramedWrite<LineCodec>       │
//!                   └──────────────────────────────┘
//! ```
//!
//! ## Back-pressure
//!
//! When the pool refuses a line with `QueueFull`, the task is parked in the
//! session and the socket is not read again until the pool signals
//! capacity. Completions keep being written in the meantime.
//!
//! ## Closing
//!
//! A `bye` or an idle timeout cancel the connection's queued tasks, wait for
//! the one that may still be running, and close without writing anything
//! further. When the peer closes its side first, or sends a line over the
//! limit, every line received before that is still answered before the
//! socket closes. The idle timer only runs while nothing is outstanding.

use crate::commands::{Handler, Reply};
use crate::connection::session::Session;
use crate::executor::{
    execute, Completion, CompletionReceiver, CompletionSender, OrderedExecutor, SubmitError, Task,
    TaskError,
};
use crate::protocol::{banner, FrameError, LineCodec};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total lines decoded
    pub lines_received: AtomicU64,
    /// Total responses written
    pub responses_sent: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
    /// Lines whose handler failed
    pub task_failures: AtomicU64,
    /// Times a connection stopped reading because the pool was saturated
    pub reads_paused: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn line_received(&self) {
        self.lines_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_sent(&self, bytes: usize) {
        self.responses_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn task_failed(&self) {
        self.task_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read_paused(&self) {
        self.reads_paused.fetch_add(1, Ordering::Relaxed);
    }
}

/// How decoded lines reach the business logic.
#[derive(Clone)]
pub enum Dispatcher {
    /// Run the handler on the connection task itself
    Inline(Arc<dyn Handler>),
    /// Submit each line to the shared worker pool
    Pooled(Arc<OrderedExecutor>),
}

/// Per-connection settings shared by all connections of a server.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Longest accepted line
    pub max_line_length: usize,
    /// Close the connection after this long without traffic
    pub idle_timeout: Option<Duration>,
    /// Host name for the connect banner; no banner when `None`
    pub greeting_host: Option<Arc<str>>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_line_length: crate::protocol::MAX_LINE_LENGTH,
            idle_timeout: None,
            greeting_host: None,
        }
    }
}

/// Why a connection was closed without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent `bye`
    ClientRequest,
    /// The client closed its side of the connection
    PeerClosed,
    /// The client sent a line over the length limit
    FrameTooLarge,
    /// No traffic within the idle timeout
    IdleTimeout,
}

/// Errors that end a connection abruptly.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Socket failure (reset, broken pipe, ...)
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The worker pool stopped accepting tasks
    #[error("executor is shut down")]
    ExecutorShutDown,
}

impl From<FrameError> for ConnectionError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => ConnectionError::Transport(e),
            FrameError::FrameTooLarge { size, max } => ConnectionError::Transport(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("line too long: {size} bytes (max: {max})"),
            )),
        }
    }
}

/// Handles a single client connection.
pub struct ConnectionHandler {
    session: Session,
    reader: FramedRead<OwnedReadHalf, LineCodec>,
    writer: FramedWrite<OwnedWriteHalf, LineCodec>,
    dispatcher: Dispatcher,
    options: ConnectionOptions,
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandler {
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `stream` - The TCP stream for this connection
    /// * `addr` - The client's socket address
    /// * `dispatcher` - Where decoded lines are handled
    /// * `options` - Line limit, idle timeout and banner
    /// * `stats` - Shared connection statistics
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        dispatcher: Dispatcher,
        options: ConnectionOptions,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();

        let (read_half, write_half) = stream.into_split();
        let codec = LineCodec::with_max_length(options.max_line_length);

        Self {
            session: Session::new(addr),
            reader: FramedRead::new(read_half, codec.clone()),
            writer: FramedWrite::new(write_half, codec),
            dispatcher,
            options,
            stats,
        }
    }

    /// Serves the connection until it closes.
    pub async fn run(mut self) -> Result<CloseReason, ConnectionError> {
        let peer = self.session.peer();
        let id = self.session.id();
        info!(client = %peer, connection = %id, "Client connected");

        let result = match self.dispatcher.clone() {
            Dispatcher::Inline(handler) => self.run_inline(handler.as_ref()).await,
            Dispatcher::Pooled(executor) => self.run_pooled(&executor).await,
        };
        self.session.close();

        match &result {
            Ok(reason) => info!(
                client = %peer,
                connection = %id,
                reason = ?reason,
                duration_ms = self.session.age().as_millis() as u64,
                "Client disconnected"
            ),
            Err(ConnectionError::Transport(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
                ) =>
            {
                debug!(client = %peer, connection = %id, "Connection reset by client")
            }
            Err(e) => warn!(client = %peer, connection = %id, error = %e, "Connection error"),
        }

        self.stats.connection_closed();
        result
    }

    /// Reactor variant: every line is handled before the next one is read.
    async fn run_inline(&mut self, handler: &dyn Handler) -> Result<CloseReason, ConnectionError> {
        self.session.open();
        self.write_banner().await?;

        let reason = loop {
            let idle = idle_timer(self.session.idle_deadline(self.options.idle_timeout));

            tokio::select! {
                frame = self.reader.next() => match frame {
                    Some(Ok(line)) => {
                        self.on_line(&line);
                        match execute(handler, &line) {
                            Completion::Done(reply) => {
                                if let Some(reason) = self.write_reply(reply).await? {
                                    break reason;
                                }
                            }
                            Completion::Failed(e) => {
                                warn!(connection = %self.session.id(), error = %e, "Line handler failed");
                                self.on_task_failed(&e);
                            }
                        }
                    }
                    Some(Err(e)) => break self.on_frame_error(e)?,
                    None => break CloseReason::PeerClosed,
                },
                _ = idle => break CloseReason::IdleTimeout,
            }
        };

        self.session.begin_closing();
        self.writer.close().await?;
        Ok(reason)
    }

    /// Half-sync/half-async variant: lines go to the pool, replies come back
    /// over a channel.
    async fn run_pooled(
        &mut self,
        executor: &OrderedExecutor,
    ) -> Result<CloseReason, ConnectionError> {
        let (reply_to, mut completions) = mpsc::unbounded_channel();

        self.session.open();
        self.write_banner().await?;

        let result = match self.pump(executor, &reply_to, &mut completions).await {
            Ok(reason) => self.finish(executor, reason, &mut completions).await,
            Err(e) => Err(e),
        };

        if result.is_err() {
            // Completions of a task still running go nowhere
            self.cancel_queued(executor);
        }
        result
    }

    async fn pump(
        &mut self,
        executor: &OrderedExecutor,
        reply_to: &CompletionSender,
        completions: &mut CompletionReceiver,
    ) -> Result<CloseReason, ConnectionError> {
        loop {
            let reading = self.session.is_reading();
            let parked_size = self.session.parked().map(Task::size);
            // Only an idle client counts, not one waiting on the pool
            let idle_armed = reading && self.session.in_flight() == 0;
            let idle = idle_timer(self.session.idle_deadline(self.options.idle_timeout));

            tokio::select! {
                biased;

                Some(completion) = completions.recv() => {
                    self.session.task_completed();
                    self.session.touch();
                    match completion {
                        Completion::Done(reply) => {
                            if let Some(reason) = self.write_reply(reply).await? {
                                return Ok(reason);
                            }
                        }
                        Completion::Failed(e) => self.on_task_failed(&e),
                    }
                }

                _ = executor.wait_for_capacity(self.session.id(), parked_size.unwrap_or(0)),
                    if parked_size.is_some() =>
                {
                    if let Some(task) = self.session.take_parked() {
                        self.submit(executor, task)?;
                        if self.session.is_reading() {
                            debug!(connection = %self.session.id(), "Pool has capacity, resuming reads");
                        }
                    }
                }

                frame = self.reader.next(), if reading => match frame {
                    Some(Ok(line)) => {
                        self.on_line(&line);
                        let task = Task::new(self.session.id(), line, reply_to.clone());
                        self.submit(executor, task)?;
                    }
                    Some(Err(e)) => return self.on_frame_error(e),
                    None => return Ok(CloseReason::PeerClosed),
                },

                _ = idle, if idle_armed => return Ok(CloseReason::IdleTimeout),
            }
        }
    }

    /// Waits for outstanding tasks, then shuts the socket down.
    ///
    /// After a peer close or an oversized line the replies to lines already
    /// received are still written; after `bye` or an idle timeout the queued
    /// tasks are cancelled and late replies dropped.
    async fn finish(
        &mut self,
        executor: &OrderedExecutor,
        mut reason: CloseReason,
        completions: &mut CompletionReceiver,
    ) -> Result<CloseReason, ConnectionError> {
        self.session.begin_closing();
        drop(self.session.take_parked());

        let mut write_back = matches!(reason, CloseReason::PeerClosed | CloseReason::FrameTooLarge);
        if !write_back {
            self.cancel_queued(executor);
        }

        while self.session.in_flight() > 0 {
            let Some(completion) = completions.recv().await else {
                break;
            };
            self.session.task_completed();

            if !write_back {
                continue;
            }
            match completion {
                Completion::Done(reply) => {
                    if let Some(close) = self.write_reply(reply).await? {
                        reason = close;
                        write_back = false;
                        self.cancel_queued(executor);
                    }
                }
                Completion::Failed(e) => self.on_task_failed(&e),
            }
        }

        self.writer.close().await?;
        Ok(reason)
    }

    fn submit(&mut self, executor: &OrderedExecutor, task: Task) -> Result<(), ConnectionError> {
        match executor.submit(task) {
            Ok(()) => {
                self.session.task_submitted();
                Ok(())
            }
            Err(SubmitError::QueueFull(task)) => {
                debug!(
                    client = %self.session.peer(),
                    connection = %self.session.id(),
                    "Pool saturated, pausing reads"
                );
                self.stats.read_paused();
                self.session.park(task);
                Ok(())
            }
            Err(SubmitError::ShutDown(_)) => Err(ConnectionError::ExecutorShutDown),
        }
    }

    fn cancel_queued(&mut self, executor: &OrderedExecutor) {
        let cancelled = executor.cancel(self.session.id());
        self.session.tasks_cancelled(cancelled);
    }

    async fn write_banner(&mut self) -> Result<(), ConnectionError> {
        let Some(host) = self.options.greeting_host.clone() else {
            return Ok(());
        };

        for line in banner::lines(&host) {
            self.writer.feed(line).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Writes a reply. Returns the close reason if the reply asks to close.
    async fn write_reply(&mut self, reply: Reply) -> Result<Option<CloseReason>, ConnectionError> {
        if let Some(text) = reply.response {
            let len = text.len();
            self.writer.send(text).await?;
            self.session.touch();
            self.stats.response_sent(len);
            trace!(connection = %self.session.id(), bytes = len, "Sent response");
        }

        Ok(reply.close.then_some(CloseReason::ClientRequest))
    }

    fn on_line(&mut self, line: &str) {
        self.session.touch();
        self.stats.line_received();
        trace!(connection = %self.session.id(), bytes = line.len(), "Received line");
    }

    fn on_task_failed(&self, error: &TaskError) {
        self.stats.task_failed();
        debug!(connection = %self.session.id(), error = %error, "No response for failed line");
    }

    fn on_frame_error(&self, error: FrameError) -> Result<CloseReason, ConnectionError> {
        match error {
            FrameError::FrameTooLarge { size, max } => {
                warn!(
                    client = %self.session.peer(),
                    connection = %self.session.id(),
                    size,
                    max,
                    "Line too long, closing connection"
                );
                Ok(CloseReason::FrameTooLarge)
            }
            FrameError::Io(e) => Err(ConnectionError::Transport(e)),
        }
    }
}

async fn idle_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Handles a client connection.
///
/// This is a convenience function that creates a ConnectionHandler
/// and runs it to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Dispatcher,
    options: ConnectionOptions,
    stats: Arc<ConnectionStats>,
) {
    let handler = ConnectionHandler::new(stream, addr, dispatcher, options, stats);
    if let Err(e) = handler.run().await {
        debug!(client = %addr, error = %e, "Connection ended with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{BoxError, EchoHandler};
    use crate::config::ExecutorConfig;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn create_test_server(
        dispatcher: Dispatcher,
        options: ConnectionOptions,
    ) -> (SocketAddr, Arc<ConnectionStats>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(ConnectionStats::new());

        let stats_clone = Arc::clone(&stats);
        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                tokio::spawn(handle_connection(
                    stream,
                    client_addr,
                    dispatcher.clone(),
                    options.clone(),
                    Arc::clone(&stats_clone),
                ));
            }
        });

        (addr, stats)
    }

    fn inline() -> Dispatcher {
        Dispatcher::Inline(Arc::new(EchoHandler::new()))
    }

    fn pooled(config: ExecutorConfig, handler: Arc<dyn Handler>) -> (Dispatcher, Arc<OrderedExecutor>) {
        let executor = Arc::new(OrderedExecutor::start(config, handler).unwrap());
        (Dispatcher::Pooled(Arc::clone(&executor)), executor)
    }

    fn workers(n: usize) -> ExecutorConfig {
        ExecutorConfig {
            workers: n,
            ..ExecutorConfig::default()
        }
    }

    async fn connect(addr: SocketAddr) -> BufReader<TcpStream> {
        BufReader::new(TcpStream::connect(addr).await.unwrap())
    }

    async fn send(client: &mut BufReader<TcpStream>, bytes: &[u8]) {
        client.get_mut().write_all(bytes).await.unwrap();
    }

    async fn read_line(client: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        let n = timeout(WAIT, client.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        assert!(n > 0, "connection closed while waiting for a line");
        line
    }

    /// The server closed the connection without sending anything else.
    async fn assert_closed(client: &mut BufReader<TcpStream>) {
        let mut rest = String::new();
        match timeout(WAIT, client.read_line(&mut rest))
            .await
            .expect("timed out waiting for close")
        {
            Ok(n) => assert_eq!(n, 0, "unexpected data before close: {rest:?}"),
            // Unread input on the server side turns the close into a reset
            Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
        }
    }

    #[tokio::test]
    async fn test_inline_echo() {
        let (addr, _) = create_test_server(inline(), ConnectionOptions::default()).await;
        let mut client = connect(addr).await;

        send(&mut client, b"hello\r\n").await;
        assert_eq!(read_line(&mut client).await, "hello\n");

        send(&mut client, b"hello\r\n").await;
        assert_eq!(read_line(&mut client).await, "hello\n");
    }

    #[tokio::test]
    async fn test_bye_closes_without_reply() {
        let (addr, stats) = create_test_server(inline(), ConnectionOptions::default()).await;

        for bye in ["bye", "BYE", "ByE"] {
            let mut client = connect(addr).await;
            send(&mut client, format!("{bye}\n").as_bytes()).await;
            assert_closed(&mut client).await;
        }

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 3);
        assert_eq!(stats.bytes_written.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_bye_with_whitespace_is_echoed() {
        let (addr, _) = create_test_server(inline(), ConnectionOptions::default()).await;
        let mut client = connect(addr).await;

        send(&mut client, b" bye\n").await;
        assert_eq!(read_line(&mut client).await, " bye\n");
    }

    #[tokio::test]
    async fn test_split_and_mixed_delimiters() {
        let (addr, _) = create_test_server(inline(), ConnectionOptions::default()).await;
        let mut client = connect(addr).await;

        send(&mut client, b"hel").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        send(&mut client, b"lo\r").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        send(&mut client, b"\nworld\rlast\n").await;

        assert_eq!(read_line(&mut client).await, "hello\n");
        assert_eq!(read_line(&mut client).await, "world\n");
        assert_eq!(read_line(&mut client).await, "last\n");
    }

    #[tokio::test]
    async fn test_empty_line_is_echoed() {
        let (addr, _) = create_test_server(inline(), ConnectionOptions::default()).await;
        let mut client = connect(addr).await;

        send(&mut client, b"\r\n").await;
        assert_eq!(read_line(&mut client).await, "\n");
    }

    #[tokio::test]
    async fn test_oversized_line_closes_connection() {
        let options = ConnectionOptions {
            max_line_length: 16,
            ..ConnectionOptions::default()
        };
        let (addr, stats) = create_test_server(inline(), options).await;
        let mut client = connect(addr).await;

        send(&mut client, b"short\n").await;
        assert_eq!(read_line(&mut client).await, "short\n");

        send(&mut client, &[b'a'; 17]).await;
        assert_closed(&mut client).await;
        assert_eq!(stats.responses_sent.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_connection() {
        let options = ConnectionOptions {
            idle_timeout: Some(Duration::from_millis(100)),
            ..ConnectionOptions::default()
        };
        let (addr, _) = create_test_server(inline(), options).await;
        let mut client = connect(addr).await;

        send(&mut client, b"ping\n").await;
        assert_eq!(read_line(&mut client).await, "ping\n");

        assert_closed(&mut client).await;
    }

    #[tokio::test]
    async fn test_pooled_banner_then_echo() {
        let (dispatcher, _executor) = pooled(workers(2), Arc::new(EchoHandler::new()));
        let options = ConnectionOptions {
            greeting_host: Some(Arc::from("test-host")),
            ..ConnectionOptions::default()
        };
        let (addr, _) = create_test_server(dispatcher, options).await;
        let mut client = connect(addr).await;

        assert_eq!(read_line(&mut client).await, "Welcome to test-host!\r\n");
        let time = read_line(&mut client).await;
        assert!(time.starts_with("It is "), "{time:?}");
        assert!(time.ends_with(" now.\r\n"), "{time:?}");

        send(&mut client, b"hello\n").await;
        assert_eq!(read_line(&mut client).await, "hello\n");

        send(&mut client, b"bye\n").await;
        assert_closed(&mut client).await;
    }

    #[tokio::test]
    async fn test_pooled_preserves_line_order() {
        // Uneven handler latency across four workers
        let handler = |line: &str| -> Result<Reply, BoxError> {
            if line.ends_with('3') {
                std::thread::sleep(Duration::from_millis(2));
            }
            Ok(Reply::respond(format!("{line}\n")))
        };
        let (dispatcher, _executor) = pooled(workers(4), Arc::new(handler));
        let (addr, _) = create_test_server(dispatcher, ConnectionOptions::default()).await;

        let mut clients = Vec::new();
        for c in 0..3 {
            let mut client = connect(addr).await;
            let payload: String = (0..200).map(|i| format!("{c}-{i}\n")).collect();
            send(&mut client, payload.as_bytes()).await;
            clients.push((c, client));
        }

        for (c, client) in &mut clients {
            for i in 0..200 {
                assert_eq!(read_line(client).await, format!("{c}-{i}\n"));
            }
        }
    }

    #[tokio::test]
    async fn test_pooled_failure_keeps_connection_open() {
        let handler = |line: &str| -> Result<Reply, BoxError> {
            match line {
                "fail" => Err("cannot echo this".into()),
                "panic" => panic!("handler exploded"),
                _ => Ok(EchoHandler::apply(line)),
            }
        };
        let (dispatcher, _executor) = pooled(workers(1), Arc::new(handler));
        let (addr, stats) = create_test_server(dispatcher, ConnectionOptions::default()).await;
        let mut client = connect(addr).await;

        send(&mut client, b"fail\npanic\nstill here\n").await;
        assert_eq!(read_line(&mut client).await, "still here\n");
        assert_eq!(stats.task_failures.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_pooled_back_pressure_answers_everything() {
        let handler = |line: &str| -> Result<Reply, BoxError> {
            std::thread::sleep(Duration::from_millis(1));
            Ok(EchoHandler::apply(line))
        };
        let config = ExecutorConfig {
            workers: 1,
            max_queued_tasks: 2,
            ..ExecutorConfig::default()
        };
        let (dispatcher, executor) = pooled(config, Arc::new(handler));
        let (addr, stats) = create_test_server(dispatcher, ConnectionOptions::default()).await;
        let mut client = connect(addr).await;

        let payload: String = (0..50).map(|i| format!("line {i}\n")).collect();
        send(&mut client, payload.as_bytes()).await;

        for i in 0..50 {
            assert_eq!(read_line(&mut client).await, format!("line {i}\n"));
        }
        assert!(executor.stats().rejected.load(Ordering::Relaxed) > 0);
        assert!(stats.reads_paused.load(Ordering::Relaxed) > 0);

        // Accounting is released just after the last reply is handed over
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.queued_tasks(), 0);
    }

    #[tokio::test]
    async fn test_pooled_bye_discards_later_lines() {
        let (dispatcher, executor) = pooled(workers(2), Arc::new(EchoHandler::new()));
        let (addr, _) = create_test_server(dispatcher, ConnectionOptions::default()).await;
        let mut client = connect(addr).await;

        send(&mut client, b"first\nbye\nsecond\nthird\n").await;
        assert_eq!(read_line(&mut client).await, "first\n");
        assert_closed(&mut client).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.queued_tasks(), 0);
        assert_eq!(executor.queued_bytes(), 0);
    }

    #[tokio::test]
    async fn test_pooled_peer_close_still_answers() {
        let handler = |line: &str| -> Result<Reply, BoxError> {
            std::thread::sleep(Duration::from_millis(5));
            Ok(EchoHandler::apply(line))
        };
        let (dispatcher, _executor) = pooled(workers(2), Arc::new(handler));
        let (addr, stats) = create_test_server(dispatcher, ConnectionOptions::default()).await;
        let mut client = connect(addr).await;

        send(&mut client, b"one\ntwo\nthree\n").await;
        client.get_mut().shutdown().await.unwrap();

        assert_eq!(read_line(&mut client).await, "one\n");
        assert_eq!(read_line(&mut client).await, "two\n");
        assert_eq!(read_line(&mut client).await, "three\n");
        assert_closed(&mut client).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_pooled_oversized_line_closes_connection() {
        let (dispatcher, _executor) = pooled(workers(1), Arc::new(EchoHandler::new()));
        let options = ConnectionOptions {
            max_line_length: 32,
            ..ConnectionOptions::default()
        };
        let (addr, _) = create_test_server(dispatcher, options).await;
        let mut client = connect(addr).await;

        send(&mut client, &[b'x'; 40]).await;
        assert_closed(&mut client).await;
    }

    #[tokio::test]
    async fn test_executor_shutdown_ends_connection() {
        let (dispatcher, executor) = pooled(workers(1), Arc::new(EchoHandler::new()));
        let (addr, _) = create_test_server(dispatcher, ConnectionOptions::default()).await;
        let mut client = connect(addr).await;

        send(&mut client, b"before\n").await;
        assert_eq!(read_line(&mut client).await, "before\n");

        let pool = Arc::clone(&executor);
        tokio::task::spawn_blocking(move || pool.shutdown())
            .await
            .unwrap();

        send(&mut client, b"after\n").await;
        assert_closed(&mut client).await;
    }

    #[tokio::test]
    async fn test_pooled_oversized_line_answers_earlier_lines() {
        let (dispatcher, _executor) = pooled(workers(2), Arc::new(EchoHandler::new()));
        let options = ConnectionOptions {
            max_line_length: 16,
            ..ConnectionOptions::default()
        };
        let (addr, stats) = create_test_server(dispatcher, options).await;
        let mut client = connect(addr).await;

        let mut payload = b"hello\n".to_vec();
        payload.extend_from_slice(&[b'x'; 40]);
        send(&mut client, &payload).await;

        assert_eq!(read_line(&mut client).await, "hello\n");
        assert_closed(&mut client).await;
        assert_eq!(stats.responses_sent.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_pooled_slow_handler_outlives_idle_timeout() {
        let handler = |line: &str| -> Result<Reply, BoxError> {
            std::thread::sleep(Duration::from_millis(400));
            Ok(EchoHandler::apply(line))
        };
        let config = ExecutorConfig {
            workers: 1,
            max_queued_tasks: 1,
            ..ExecutorConfig::default()
        };
        let (dispatcher, _executor) = pooled(config, Arc::new(handler));
        let options = ConnectionOptions {
            idle_timeout: Some(Duration::from_millis(150)),
            ..ConnectionOptions::default()
        };
        let (addr, stats) = create_test_server(dispatcher, options).await;
        let mut client = connect(addr).await;

        // The second line is refused and parked while the first one runs
        send(&mut client, b"slow\nslower\n").await;
        assert_eq!(read_line(&mut client).await, "slow\n");
        assert_eq!(read_line(&mut client).await, "slower\n");
        assert!(stats.reads_paused.load(Ordering::Relaxed) > 0);

        // Nothing outstanding any more, so the idle timer applies again
        assert_closed(&mut client).await;
    }
}
