//! Transport layer - Pure I/O abstraction for byte-stream exchange
//!
//! This module provides the core transport abstraction that moves raw byte
//! chunks between the client and an external process, without knowledge of
//! message framing or process management. Chunk boundaries carry no meaning:
//! a frame may arrive split across many chunks or share a chunk with its
//! neighbors.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tracing::{error, trace};

/// Read buffer size for the stdout reader task
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Error types shared by all transport implementations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Channel error: {0}")]
    Channel(String),
}

/// Core transport trait for bidirectional byte exchange
///
/// `send` must deliver the given bytes as one contiguous write relative to
/// other `send` calls - encoded frames are never interleaved on the wire.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a complete encoded frame
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Receive the next chunk of bytes (arbitrary size, at least one byte)
    async fn receive(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if transport is still active
    fn is_connected(&self) -> bool;
}

// ============================================================================
// Stdio Transport Implementation
// ============================================================================

/// Transport implementation using a child process's stdin/stdout streams
pub struct StdioTransport {
    /// Channel for sending frames to stdin
    stdin_sender: Option<mpsc::UnboundedSender<Vec<u8>>>,

    /// Channel for receiving chunks from stdout
    stdout_receiver: Option<mpsc::UnboundedReceiver<Vec<u8>>>,

    /// Connection status
    connected: bool,
}

impl StdioTransport {
    /// Create a new StdioTransport from child process streams
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let (stdin_sender, stdin_receiver) = mpsc::unbounded_channel();
        let (stdout_sender, stdout_receiver) = mpsc::unbounded_channel();

        // Background task for stdin writing - all frames funnel through one
        // writer, which serializes them relative to each other
        tokio::spawn(Self::stdin_writer_task(stdin, stdin_receiver));

        // Background task for stdout reading
        tokio::spawn(Self::stdout_reader_task(stdout, stdout_sender));

        Self {
            stdin_sender: Some(stdin_sender),
            stdout_receiver: Some(stdout_receiver),
            connected: true,
        }
    }

    /// Background task that writes frames to stdin
    async fn stdin_writer_task(
        mut stdin: ChildStdin,
        mut receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        while let Some(frame) = receiver.recv().await {
            trace!("StdioTransport: writing {} bytes to stdin", frame.len());

            if let Err(e) = stdin.write_all(&frame).await {
                error!("Failed to write to stdin: {}", e);
                break;
            }

            if let Err(e) = stdin.flush().await {
                error!("Failed to flush stdin: {}", e);
                break;
            }
        }

        trace!("StdioTransport: stdin writer task finished");
    }

    /// Background task that reads byte chunks from stdout
    async fn stdout_reader_task(mut stdout: ChildStdout, sender: mpsc::UnboundedSender<Vec<u8>>) {
        let mut buf = [0u8; READ_CHUNK_SIZE];

        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => {
                    // EOF reached
                    trace!("StdioTransport: stdout reader reached EOF");
                    break;
                }
                Ok(n) => {
                    trace!("StdioTransport: read {} bytes from stdout", n);

                    if sender.send(buf[..n].to_vec()).is_err() {
                        trace!("StdioTransport: stdout receiver dropped, stopping reader");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to read from stdout: {}", e);
                    break;
                }
            }
        }

        trace!("StdioTransport: stdout reader task finished");
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }

        let sender = self
            .stdin_sender
            .as_ref()
            .ok_or(TransportError::Disconnected)?;

        sender
            .send(frame.to_vec())
            .map_err(|e| TransportError::Channel(e.to_string()))?;

        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }

        let receiver = self
            .stdout_receiver
            .as_mut()
            .ok_or(TransportError::Disconnected)?;

        receiver.recv().await.ok_or(TransportError::Disconnected)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        self.stdin_sender.take();
        self.stdout_receiver.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
