//! Testing utilities - scriptable in-memory transport
//!
//! [`MockTransport`] stands in for a live language server process. Sent
//! frames are decoded and recorded; tests either inject inbound messages by
//! hand through the [`MockTransportHandle`] or install a responder closure
//! that answers each sent message like a stub server would.

use crate::io::{Transport, TransportError};
use crate::lsp::framing::{FrameBuffer, encode_frame};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type Responder = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// Mock transport for testing the correlator and supervisor in isolation
pub struct MockTransport {
    /// Messages decoded from sent frames
    sent: Arc<Mutex<Vec<Value>>>,

    /// Decoder for outgoing frames (the "server's" inbound side)
    decoder: FrameBuffer,

    /// Queue the client's receive() side drains
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,

    /// Optional stub-server behavior applied to each sent message
    responder: Option<Responder>,

    connected: bool,
}

/// Test-side handle for inspecting sent traffic and injecting inbound data
#[derive(Clone)]
pub struct MockTransportHandle {
    sent: Arc<Mutex<Vec<Value>>>,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl MockTransportHandle {
    /// All messages the client has sent, in order
    pub fn sent_messages(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    /// Inject one inbound message, framed
    pub fn inject(&self, message: Value) {
        self.inject_bytes(encode_frame(&message));
    }

    /// Inject raw inbound bytes (for chunking and malformed-frame tests)
    pub fn inject_bytes(&self, bytes: Vec<u8>) {
        let _ = self.inbound_tx.send(bytes);
    }
}

impl MockTransport {
    /// Create a silent mock; inbound traffic comes only from the handle
    pub fn new() -> (Self, MockTransportHandle) {
        Self::build(None)
    }

    /// Create a mock that answers each sent message via `responder`
    ///
    /// The responder sees the decoded message and returns the full reply
    /// message to inject, or `None` to stay silent (e.g. for notifications).
    pub fn with_responder<F>(responder: F) -> (Self, MockTransportHandle)
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        Self::build(Some(Arc::new(responder)))
    }

    fn build(responder: Option<Responder>) -> (Self, MockTransportHandle) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let handle = MockTransportHandle {
            sent: Arc::clone(&sent),
            inbound_tx: inbound_tx.clone(),
        };

        let transport = Self {
            sent,
            decoder: FrameBuffer::new(),
            inbound_tx,
            inbound_rx,
            responder,
            connected: true,
        };

        (transport, handle)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }

        for message in self.decoder.feed(frame) {
            let reply = self.responder.as_ref().and_then(|r| r(&message));
            self.sent.lock().unwrap().push(message);

            if let Some(reply) = reply {
                let _ = self.inbound_tx.send(encode_frame(&reply));
            }
        }

        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }

        self.inbound_rx
            .recv()
            .await
            .ok_or(TransportError::Disconnected)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
