//! Error types shared across the daemon.
//!
//! The `Display` text of catalog and command errors is sent verbatim to
//! clients after the `ERR - ` prefix, so messages here are part of the wire
//! protocol.

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced in logs and client replies.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad command syntax, unknown attribute, out-of-range numeric.
    #[error("{0}")]
    InputInvalid(String),

    /// Zone looked up by name is missing.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate name, malformed box, zero/negative Z.
    #[error("{0}")]
    Conflict(String),

    /// Allocation failure or a client buffer overflow.
    #[error("{0}")]
    ResourceExhausted(String),

    /// Sensor stream failure; fatal for the main loop by policy.
    #[error("sensor error: {0}")]
    Sensor(String),

    /// Watchdog overrun.
    #[error("timed out: {0}")]
    Timeout(String),

    /// I/O error (persistence write, socket).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InputInvalid(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }
}
