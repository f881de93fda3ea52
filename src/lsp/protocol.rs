//! JSON-RPC 2.0 protocol layer - the request correlator
//!
//! [`JsonRpcClient`] owns one handler task that moves frames in both
//! directions over a [`Transport`]: outbound frames are drained from a
//! channel (keeping writes serialized), inbound byte chunks flow through a
//! [`FrameBuffer`] and decoded messages are dispatched in arrival order.
//! Responses are matched to callers purely by id - never by send order.

use crate::io::Transport;
use crate::lsp::error::LspError;
use crate::lsp::framing::{FrameBuffer, encode_frame};
use crate::lsp::jsonrpc::{
    JSONRPC_VERSION, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message,
    method_not_found_response,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, trace, warn};

/// Default per-request deadline; a hung server settles the caller with
/// [`LspError::Timeout`] instead of stalling forever
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the notification broadcast channel
const NOTIFICATION_CHANNEL_CAPACITY: usize = 64;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, LspError>>>>>;

/// JSON-RPC client with request/response correlation
///
/// Cheap to clone; all clones share the same pending map, id counter, and
/// handler task.
#[derive(Clone)]
pub struct JsonRpcClient {
    /// Channel feeding encoded frames to the handler task's write path
    outbound: mpsc::UnboundedSender<Vec<u8>>,

    /// Request id counter; every allocated id is used exactly once
    next_id: Arc<AtomicU64>,

    /// Pending requests waiting for their correlated response
    pending: PendingMap,

    /// Unsolicited server notifications fan out through here
    notifications: broadcast::Sender<JsonRpcNotification>,

    /// Deadline applied by [`request`](Self::request)
    default_timeout: Duration,
}

impl JsonRpcClient {
    /// Create a new client driving the given transport
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_timeout(transport, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a new client with a custom default request timeout
    pub fn with_timeout(transport: Box<dyn Transport>, default_timeout: Duration) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (notifications, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);

        tokio::spawn(Self::handler_task(
            transport,
            outbound_rx,
            outbound.clone(),
            Arc::clone(&pending),
            notifications.clone(),
        ));

        Self {
            outbound,
            next_id: Arc::new(AtomicU64::new(1)),
            pending,
            notifications,
            default_timeout,
        }
    }

    /// The handler task: single owner of the transport for its whole life
    async fn handler_task(
        mut transport: Box<dyn Transport>,
        mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        reply_tx: mpsc::UnboundedSender<Vec<u8>>,
        pending: PendingMap,
        notifications: broadcast::Sender<JsonRpcNotification>,
    ) {
        let mut frames = FrameBuffer::new();

        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(frame) => {
                            if let Err(e) = transport.send(&frame).await {
                                error!("Failed to send frame: {}", e);
                                break;
                            }
                        }
                        None => break,
                    }
                }
                inbound = transport.receive() => {
                    match inbound {
                        Ok(chunk) => {
                            for value in frames.feed(&chunk) {
                                Self::dispatch(value, &pending, &notifications, &reply_tx);
                            }
                        }
                        Err(e) => {
                            debug!("Transport closed: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        let _ = transport.close().await;
        trace!("JsonRpcClient: handler task finished");
    }

    /// Dispatch one decoded inbound message
    fn dispatch(
        value: Value,
        pending: &PendingMap,
        notifications: &broadcast::Sender<JsonRpcNotification>,
        reply_tx: &mpsc::UnboundedSender<Vec<u8>>,
    ) {
        match Message::classify(value) {
            Some(Message::Response(response)) => {
                Self::settle(response, pending);
            }
            Some(Message::Notification(notification)) => {
                trace!("Received notification: {}", notification.method);
                // No subscribers is fine; notifications are fire-and-forget
                let _ = notifications.send(notification);
            }
            Some(Message::Request(request)) => {
                // Server -> client requests are outside the supported surface;
                // answer so the server does not wait forever
                debug!("Rejecting server request: {}", request.method);
                let reply = method_not_found_response(request.id, &request.method);
                if let Ok(frame) = serde_json::to_value(&reply).map(|v| encode_frame(&v)) {
                    let _ = reply_tx.send(frame);
                }
            }
            None => {
                debug!("Dropping unclassifiable message");
            }
        }
    }

    /// Settle the pending entry matching a response's id
    fn settle(response: JsonRpcResponse, pending: &PendingMap) {
        let Some(id) = response.id.as_u64() else {
            debug!("Dropping response with non-integer id: {:?}", response.id);
            return;
        };

        let Some(sender) = pending.lock().unwrap().remove(&id) else {
            debug!("Dropping response for unknown request id {}", id);
            return;
        };

        let outcome = match response.error {
            Some(error) => Err(LspError::Request {
                code: error.code,
                message: error.message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };

        if sender.send(outcome).is_err() {
            // Caller dropped interest; a late response settles harmlessly
            trace!("Response receiver dropped for request {}", id);
        }
    }

    /// Send a request and await its correlated response (default timeout)
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, LspError> {
        self.request_with_timeout(method, params, self.default_timeout)
            .await
    }

    /// Send a request with an explicit deadline
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, LspError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (response_tx, response_rx) = oneshot::channel();

        // Register before writing so an arbitrarily fast response still finds
        // its pending entry
        self.pending.lock().unwrap().insert(id, response_tx);

        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Value::from(id),
            method: method.to_string(),
            params,
        };

        let frame = encode_frame(&serde_json::to_value(&request)?);
        crate::log_lsp_message!(tracing::Level::DEBUG, "outbound", method, request.params);

        if self.outbound.send(frame).is_err() {
            self.pending.lock().unwrap().remove(&id);
            return Err(LspError::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                // Sender dropped without settling: the pending map was torn down
                self.pending.lock().unwrap().remove(&id);
                Err(LspError::ConnectionClosed)
            }
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                warn!("Request {} ({}) timed out", id, method);
                Err(LspError::Timeout)
            }
        }
    }

    /// Send a notification; never registers a pending entry
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), LspError> {
        let notification = JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        };

        let frame = encode_frame(&serde_json::to_value(&notification)?);
        crate::log_lsp_message!(tracing::Level::DEBUG, "outbound", method, notification.params);

        self.outbound
            .send(frame)
            .map_err(|_| LspError::ConnectionClosed)
    }

    /// Subscribe to unsolicited server notifications
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<JsonRpcNotification> {
        self.notifications.subscribe()
    }

    /// Settle every outstanding request with [`LspError::ProcessExited`]
    ///
    /// Called on subprocess termination so no caller is left waiting forever.
    pub fn fail_all_pending(&self) {
        let drained: Vec<_> = self.pending.lock().unwrap().drain().collect();
        for (id, sender) in drained {
            debug!("Failing pending request {} after process exit", id);
            let _ = sender.send(Err(LspError::ProcessExited));
        }
    }

    /// Number of requests currently awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Check if the write path is still open
    pub fn is_connected(&self) -> bool {
        !self.outbound.is_closed()
    }
}
