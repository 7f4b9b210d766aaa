//! Error types for the relay engine.

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the relay engine.
///
/// Per-packet errors stop at the connection handler, per-session errors
/// dispose the session, per-listener errors end that listener; none of them
/// bring the process down.
#[derive(Debug, Error)]
pub enum Error {
    /// A data-port packet could not be decoded.
    #[error("bad packet: {0}")]
    BadPacket(#[from] icegate_ice_proto::Error),

    /// A connectivity check arrived for a username no signaling installed.
    #[error("no pending session for username {0:?}")]
    CacheMiss(String),

    /// The upstream agent could not be brought up.
    #[error("upstream agent failed to start: {0}")]
    UpstreamStart(String),

    /// Data offered to an upstream agent before it reached Ready.
    #[error("upstream agent is not ready")]
    UpstreamNotReady,

    /// Data offered to an upstream agent after teardown.
    #[error("upstream agent is closed")]
    UpstreamClosed,

    /// Invalid runtime configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Underlying socket failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
