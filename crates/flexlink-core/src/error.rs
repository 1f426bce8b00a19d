//! Error types for flexlink.
//!
//! All fallible operations across the workspace return [`Result<T>`], which
//! uses [`Error`] as the error type. Failures that end a session are also
//! reported as status events on the owning channel, so a caller that only
//! watches events still learns about them.

use std::net::IpAddr;

/// The error type for all flexlink operations.
///
/// Variants follow the failure taxonomy of the discovery and transport
/// layer: socket failures, undecodable wire data, synchronous policy
/// rejections, token acquisition failures, and TLS handshake failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A socket-level failure (bind, connect, write).
    #[error("transport error: {0}")]
    Transport(String),

    /// Every port tried while binding a UDP socket was unavailable.
    #[error("failed to bind UDP {ip}:{first_port} after {attempts} attempt(s): {reason}")]
    BindExhausted {
        ip: IpAddr,
        first_port: u16,
        /// Binds actually attempted, which can be fewer than the budget
        /// when the walk reaches port 65535.
        attempts: u32,
        reason: String,
    },

    /// An undecodable frame or unparseable line.
    ///
    /// Receive loops log and drop the offending unit; the channel stays up.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out waiting for a connection to be established.
    #[error("timeout waiting for connection")]
    Timeout,

    /// A request was rejected before any socket call was attempted
    /// (for example, hole punching without a local interface).
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The authentication collaborator could not issue a token.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The TLS upgrade of an established TCP connection failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The channel has not been connected, or has been closed.
    #[error("not connected")]
    NotConnected,

    /// The remote end closed the connection.
    #[error("connection lost")]
    ConnectionLost,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
