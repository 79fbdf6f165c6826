//! Line Protocol
//!
//! The wire format of the echo service: UTF-8 text, one message per line,
//! lines terminated by CR, LF or CRLF and capped at 8192 bytes.
//!
//! ## Modules
//!
//! - `codec`: `LineCodec`, the framing decoder and verbatim encoder
//! - `banner`: the greeting lines sent on connect in half-sync/half-async mode
//!
//! ## Example
//!
//! ```ignore
//! use hsha_echo::protocol::LineCodec;
//! use tokio_util::codec::FramedRead;
//!
//! let (read_half, _write_half) = stream.into_split();
//! let mut lines = FramedRead::new(read_half, LineCodec::new());
//!
//! while let Some(line) = lines.next().await {
//!     println!("received {:?}", line?);
//! }
//! ```

pub mod banner;
pub mod codec;

// Re-export commonly used types for convenience
pub use codec::{FrameError, LineCodec, MAX_LINE_LENGTH};
