//! Domain-specific error types for the relay.
//!
//! All fallible operations return `Result<T, RelayError>`.
//! Fatal kinds end the relay loop; a declined resize is the only
//! recoverable failure and never surfaces as an error value.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the relay core.
#[derive(Debug, Error)]
pub enum RelayError {
    // ── Startup Errors ───────────────────────────────────────────
    /// The upstream server could not be reached or the handshake failed.
    #[error("upstream connection failed: {0}")]
    Connection(String),

    /// The downstream listen port could not be bound.
    #[error("failed to bind downstream listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// A framebuffer allocation could not be satisfied.
    #[error("out of memory allocating {width}x{height} framebuffer")]
    OutOfMemory { width: u16, height: u16 },

    // ── Runtime Errors ───────────────────────────────────────────
    /// The upstream sent a malformed or unsupported message, or went away.
    #[error("upstream protocol error: {0}")]
    Protocol(String),

    /// The downstream server refused a region update.
    #[error("downstream publish failed: {0}")]
    Publish(String),

    /// A relay state transition was requested from the wrong state.
    #[error("invalid relay state transition: {0}")]
    InvalidTransition(&'static str),

    /// The TCP/IO layer reported an error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl RelayError {
    /// Whether this error must stop the relay.
    ///
    /// Only `OutOfMemory` is ever handled locally, and only on the
    /// resize path; everywhere else it is fatal as well.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RelayError::InvalidTransition(_))
    }

    /// Shorthand for a protocol error built from anything displayable.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        RelayError::Protocol(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = RelayError::OutOfMemory {
            width: 640,
            height: 480,
        };
        assert!(e.to_string().contains("640x480"));

        let e = RelayError::Bind {
            port: 5901,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(e.to_string().contains("5901"));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: RelayError = io_err.into();
        assert!(matches!(e, RelayError::Io(_)));
        assert!(e.is_fatal());
    }

    #[test]
    fn transition_errors_are_not_fatal() {
        assert!(!RelayError::InvalidTransition("nope").is_fatal());
        assert!(RelayError::protocol("bad message").is_fatal());
    }
}
