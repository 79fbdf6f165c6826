//! Command Handling
//!
//! The business-logic stage between decoding and encoding.
//!
//! ## Pipeline
//!
//! ```text
//! Client bytes
//!       │
//!       ▼
//! ┌─────────────────┐
//! │   LineCodec     │  decode (protocol module)
//! └────────┬────────┘
//!          │ line
//!          ▼
//! ┌─────────────────┐
//! │    Handler      │  (this module)
//! │                 │
//! │  line -> Reply  │
//! └────────┬────────┘
//!          │ Reply { response, close }
//!          ▼
//! ┌─────────────────┐
//! │   LineCodec     │  encode, then optional close
//! └─────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! - any line: echoed back with a trailing `\n`
//! - `bye` (any case): close the connection, no response

pub mod echo;

// Re-export the handler types
pub use echo::{BoxError, EchoHandler, Handler, Reply};
