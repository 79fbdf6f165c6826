//! Connection Session
//!
//! Per-connection bookkeeping owned by the connection task. Workers never
//! touch a session; they only see the connection's [`ConnectionId`] inside
//! the tasks they run.
//!
//! ## Lifecycle
//!
//! ```text
//! Connecting ──open()──> Open ──begin_closing()──> Closing ──close()──> Closed
//!      │                                               ▲
//!      └──────────────────begin_closing()──────────────┘
//! ```

use crate::executor::Task;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates a fresh id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, banner not yet sent
    Connecting,
    /// Reading lines and writing replies
    Open,
    /// No more reads; waiting for outstanding tasks and flushing
    Closing,
    /// Socket shut down
    Closed,
}

/// State of one client connection.
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    peer: SocketAddr,
    state: ConnectionState,
    opened_at: Instant,
    last_activity: Instant,
    /// Tasks submitted to the pool whose completion has not arrived yet
    in_flight: usize,
    /// Task refused by a saturated pool; reads stay paused while it is held
    parked: Option<Task>,
}

impl Session {
    pub fn new(peer: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::next(),
            peer,
            state: ConnectionState::Connecting,
            opened_at: now,
            last_activity: now,
            in_flight: 0,
            parked: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Time since the connection was accepted.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    pub fn open(&mut self) {
        debug_assert_eq!(self.state, ConnectionState::Connecting);
        self.state = ConnectionState::Open;
        self.touch();
    }

    /// Stops reading. Idempotent; has no effect once closed.
    pub fn begin_closing(&mut self) {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Open) {
            self.state = ConnectionState::Closing;
        }
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
        self.parked = None;
    }

    /// True while new lines should be read from the socket.
    pub fn is_reading(&self) -> bool {
        self.state == ConnectionState::Open && self.parked.is_none()
    }

    /// Records traffic on the connection.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// When the connection counts as idle, if an idle timeout is set.
    pub fn idle_deadline(&self, timeout: Option<Duration>) -> Option<Instant> {
        timeout.map(|timeout| self.last_activity + timeout)
    }

    pub fn task_submitted(&mut self) {
        self.in_flight += 1;
    }

    pub fn task_completed(&mut self) {
        debug_assert!(self.in_flight > 0, "completion without a submitted task");
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn tasks_cancelled(&mut self, count: usize) {
        debug_assert!(self.in_flight >= count);
        self.in_flight = self.in_flight.saturating_sub(count);
    }

    /// Holds a refused task and pauses reading until it is resubmitted.
    pub fn park(&mut self, task: Task) {
        debug_assert!(self.parked.is_none());
        self.parked = Some(task);
    }

    pub fn parked(&self) -> Option<&Task> {
        self.parked.as_ref()
    }

    pub fn take_parked(&mut self) -> Option<Task> {
        self.parked.take()
    }
}
