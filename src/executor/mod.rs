//! Half-Sync Executor
//!
//! The synchronous half of the half-sync/half-async server: a fixed pool of
//! worker threads fed through one bounded queue, with per-connection FIFO
//! ordering.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │          Connection tasks (async, tokio)                    │
//! │   conn 1 ──submit──┐   conn 2 ──submit──┐   conn 3 ...      │
//! └────────────────────┼────────────────────┼───────────────────┘
//!                      ▼                    ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 OrderedExecutor                             │
//! │  Mutex<PoolState>                                           │
//! │   lanes: conn 1 [t1, t2]  conn 2 [t1]   ready: [1, 2]       │
//! │   queued_tasks / queued_bytes  (bounded)                    │
//! │                                                             │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐        │
//! │  │ worker 0 │ │ worker 1 │ │ worker 2 │ │ ...N     │        │
//! │  └────┬─────┘ └────┬─────┘ └────┬─────┘ └──────────┘        │
//! └───────┼────────────┼────────────┼───────────────────────────┘
//!         │ Completion │            │
//!         ▼            ▼            ▼
//!   per-connection mpsc channels, drained and written by the connection task
//! ```
//!
//! ## Example
//!
//! ```
//! use hsha_echo::commands::{EchoHandler, Reply};
//! use hsha_echo::config::ExecutorConfig;
//! use hsha_echo::connection::ConnectionId;
//! use hsha_echo::executor::{Completion, OrderedExecutor, Task};
//! use std::sync::Arc;
//!
//! let executor = OrderedExecutor::start(ExecutorConfig::default(), Arc::new(EchoHandler)).unwrap();
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!
//! executor.submit(Task::new(ConnectionId::next(), "hello".to_string(), tx)).unwrap();
//! assert_eq!(rx.blocking_recv(), Some(Completion::Done(Reply::respond("hello\n"))));
//!
//! executor.shutdown();
//! ```

pub mod pool;
pub mod task;

// Re-export commonly used types
pub use pool::{ExecutorError, ExecutorStats, OrderedExecutor, SubmitError};
pub use task::{
    checked_estimated_size, estimated_size, execute, Completion, CompletionReceiver,
    CompletionSender, Task, TaskError, TASK_OVERHEAD,
};
