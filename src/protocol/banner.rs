//! Connection banner sent by the half-sync/half-async server.
//!
//! Two CRLF terminated lines, written before the client sends anything:
//!
//! ```text
//! Welcome to <hostname>!
//! It is <local date and time> now.
//! ```

use chrono::{DateTime, Local, TimeZone};
use std::fmt::Display;

/// e.g. `Sat Oct 17 22:18:00 UTC 2026`
const TIMESTAMP_FORMAT: &str = "%a %b %d %H:%M:%S %Z %Y";

/// Builds the greeting line for a host.
pub fn greeting(hostname: &str) -> String {
    format!("Welcome to {hostname}!\r\n")
}

/// Builds the time-of-day line for a given instant.
pub fn timestamp<Tz>(now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!("It is {} now.\r\n", now.format(TIMESTAMP_FORMAT))
}

/// Returns both banner lines, stamped with the current local time.
pub fn lines(hostname: &str) -> [String; 2] {
    [greeting(hostname), timestamp(&Local::now())]
}

/// Resolves the name this machine announces in its greeting.
///
/// Uses the system host name, or `localhost` if it is empty or not UTF-8.
pub fn local_hostname() -> String {
    gethostname::gethostname()
        .into_string()
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
