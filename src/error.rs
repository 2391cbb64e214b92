//! Error types for the RFB server library.

use std::io;
use thiserror::Error;

/// Result type for RFB operations.
pub type Result<T> = std::result::Result<T, VncError>;

/// Errors that can occur in RFB server operations.
#[derive(Debug, Error)]
pub enum VncError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// RFB protocol error (framing, unknown message tag, bad handshake).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// The client's handshake response did not arrive in time.
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// Pixel format is outside the supported 8/16/32 bpp set.
    #[error("Invalid pixel format")]
    InvalidPixelFormat,

    /// Encoding error (compression stream failure mid-rectangle).
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,
}
