//! LSP client error taxonomy
//!
//! Framing errors never surface here - the framer logs and skips bad frames.
//! Request-level failures stay local to the one caller; process-level
//! failures surface as lifecycle events. Nothing in this module is ever
//! allowed to take down the host process.

use crate::io::{ProcessError, TransportError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LspError {
    /// Byte-level I/O failure on the wire to the subprocess
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Subprocess lifecycle failure (spawn, missing pipes)
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// The server returned a JSON-RPC error object for one request
    #[error("Server error {code}: {message}")]
    Request { code: i32, message: String },

    /// Request attempted before the initialize handshake completed
    #[error("Language server is not ready")]
    NotReady,

    /// The subprocess terminated while the request was outstanding
    #[error("Language server process exited")]
    ProcessExited,

    /// No response arrived within the request's deadline
    #[error("Request timed out")]
    Timeout,

    /// The outbound channel to the writer task is gone
    #[error("Connection closed")]
    ConnectionClosed,

    /// Handshake or payload shape violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
