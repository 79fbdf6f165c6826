//! Echo Command
//!
//! The business stage of the pipeline. A [`Handler`] turns one decoded line
//! into a [`Reply`]: optionally some text to send back, and whether the
//! connection should be closed afterwards.
//!
//! Handlers are plain synchronous functions. In reactor mode they run on the
//! connection's I/O task, in half-sync/half-async mode on a pool worker, so
//! they must be `Send + Sync` and free to block only in the latter.

/// Error type returned by handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler wants done with the connection after one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Text to write back, terminator included
    pub response: Option<String>,
    /// Close the connection once the response (if any) is flushed
    pub close: bool,
}

impl Reply {
    /// A reply that writes `text` and keeps the connection open.
    pub fn respond(text: impl Into<String>) -> Self {
        Self {
            response: Some(text.into()),
            close: false,
        }
    }

    /// A reply that writes nothing and closes the connection.
    pub fn close() -> Self {
        Self {
            response: None,
            close: true,
        }
    }
}

/// Business logic invoked once per decoded line.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, line: &str) -> Result<Reply, BoxError>;
}

impl<F> Handler for F
where
    F: Fn(&str) -> Result<Reply, BoxError> + Send + Sync + 'static,
{
    fn handle(&self, line: &str) -> Result<Reply, BoxError> {
        self(line)
    }
}

/// Echoes every line back until the client says `bye`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl EchoHandler {
    pub fn new() -> Self {
        Self
    }

    /// Maps a line to its reply.
    ///
    /// `bye` in any letter case closes the connection without a response;
    /// anything else comes back unchanged with a trailing `\n`.
    pub fn apply(line: &str) -> Reply {
        if line.to_lowercase() == "bye" {
            Reply::close()
        } else {
            Reply::respond(format!("{line}\n"))
        }
    }
}

impl Handler for EchoHandler {
    fn handle(&self, line: &str) -> Result<Reply, BoxError> {
        Ok(Self::apply(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_appends_newline() {
        assert_eq!(EchoHandler::apply("hello"), Reply::respond("hello\n"));
    }

    #[test]
    fn test_echo_keeps_text_verbatim() {
        let line = "  Mixed CASE, spaces\tand unicode: héllo  ";
        let reply = EchoHandler::apply(line);
        assert_eq!(reply.response.as_deref(), Some(format!("{line}\n").as_str()));
        assert!(!reply.close);
    }

    #[test]
    fn test_empty_line_is_echoed() {
        assert_eq!(EchoHandler::apply(""), Reply::respond("\n"));
    }

    #[test]
    fn test_bye_any_case_closes() {
        for line in ["bye", "BYE", "ByE", "bYe"] {
            assert_eq!(EchoHandler::apply(line), Reply::close(), "line {line:?}");
        }
    }

    #[test]
    fn test_bye_must_match_exactly() {
        for line in ["bye ", " bye", "byebye", "goodbye"] {
            let reply = EchoHandler::apply(line);
            assert!(!reply.close, "line {line:?}");
            assert!(reply.response.is_some());
        }
    }

    #[test]
    fn test_same_line_twice_gives_same_reply() {
        assert_eq!(EchoHandler::apply("again"), EchoHandler::apply("again"));
    }

    #[test]
    fn test_closure_handler() {
        let shout = |line: &str| -> Result<Reply, BoxError> {
            Ok(Reply::respond(line.to_uppercase()))
        };
        assert_eq!(shout.handle("hi").unwrap(), Reply::respond("HI"));
    }

    #[test]
    fn test_handler_trait_object() {
        let handler: Box<dyn Handler> = Box::new(EchoHandler::new());
        assert_eq!(handler.handle("ping").unwrap(), Reply::respond("ping\n"));
    }
}
