//! Pool Tasks
//!
//! A [`Task`] is one decoded line on its way from a connection to a worker.
//! Its result travels back as a [`Completion`] over the connection's own
//! channel; the connection task alone decides what to write and when to
//! close.

use crate::commands::{Handler, Reply};
use crate::connection::ConnectionId;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

/// Where workers deliver the outcome of a connection's tasks.
pub type CompletionSender = mpsc::UnboundedSender<Completion>;

/// Receiving side of [`CompletionSender`], owned by the connection task.
pub type CompletionReceiver = mpsc::UnboundedReceiver<Completion>;

/// Fixed bookkeeping cost charged to every task on top of its line.
pub const TASK_OVERHEAD: usize = std::mem::size_of::<Task>();

/// Estimated memory footprint of a task carrying a line of `line_len` bytes.
///
/// Saturates at `usize::MAX`; see [`checked_estimated_size`].
pub const fn estimated_size(line_len: usize) -> usize {
    line_len.saturating_add(TASK_OVERHEAD)
}

/// Like [`estimated_size`], but `None` when the estimate overflows.
pub const fn checked_estimated_size(line_len: usize) -> Option<usize> {
    line_len.checked_add(TASK_OVERHEAD)
}

/// Outcome of running one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The handler produced a reply
    Done(Reply),
    /// The handler failed; nothing should be written
    Failed(TaskError),
}

/// Why a task produced no reply.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("handler returned an error: {0}")]
    Handler(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// One unit of pool work: a line received on a connection.
#[derive(Debug)]
pub struct Task {
    connection: ConnectionId,
    line: String,
    enqueued_at: Instant,
    size: usize,
    reply_to: CompletionSender,
}

impl Task {
    pub fn new(connection: ConnectionId, line: String, reply_to: CompletionSender) -> Self {
        let size = estimated_size(line.len());
        Self {
            connection,
            line,
            enqueued_at: Instant::now(),
            size,
            reply_to,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    /// Estimated bytes this task holds while outstanding.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Time since the task was created.
    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    /// Hands the outcome back to the connection.
    ///
    /// Returns `false` if the connection is already gone, in which case the
    /// completion is dropped.
    pub(crate) fn complete(self, completion: Completion) -> bool {
        self.reply_to.send(completion).is_ok()
    }
}

/// Runs a handler on one line, turning errors and panics into
/// [`Completion::Failed`].
pub fn execute(handler: &dyn Handler, line: &str) -> Completion {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(line))) {
        Ok(Ok(reply)) => Completion::Done(reply),
        Ok(Err(e)) => Completion::Failed(TaskError::Handler(e.to_string())),
        Err(payload) => Completion::Failed(TaskError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
