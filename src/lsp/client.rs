//! Language server supervisor
//!
//! [`LanguageClient`] owns exactly one language server subprocess: it spawns
//! the configured command, wires stdout through the framer into the
//! correlator and stderr into a diagnostics channel, performs the
//! initialize/initialized handshake, and supervises shutdown and crash
//! recovery. Typed request helpers degrade to empty results while the
//! handshake has not completed, matching how editor callers treat a missing
//! language server: silently, with other sources filling the gap.

use crate::io::{
    ChildProcessManager, ProcessExitEvent, ProcessExitHandler, ProcessManager, StderrMonitor,
    StopMode,
};
use crate::lsp::config::ServerConfig;
use crate::lsp::error::LspError;
use crate::lsp::protocol::JsonRpcClient;
use async_trait::async_trait;
use lsp_types::{CompletionItem, GotoDefinitionResponse, Hover};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// How long a stopping server gets between the shutdown request and SIGKILL
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Deadline for the initialize round trip
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Supervisor lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    HandshakePending,
    Ready,
    Stopping,
    Crashed,
}

/// Editor-side cursor position (zero-based row/column)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub row: u32,
    pub column: u32,
}

/// Build a `file://` URI for an absolute path
fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Supervisor for one language server process
pub struct LanguageClient {
    config: ServerConfig,
    state: Arc<Mutex<LifecycleState>>,
    process: Arc<tokio::sync::Mutex<Option<ChildProcessManager>>>,
    rpc: Arc<Mutex<Option<JsonRpcClient>>>,

    /// Server stderr lines, re-broadcast as diagnostics
    stderr_lines: broadcast::Sender<String>,

    /// Fired on unexpected process exit, carrying the exit code
    exits: broadcast::Sender<ProcessExitEvent>,
}

/// Exit handler installed on the process manager; turns an unexpected exit
/// into the Crashed transition and settles every outstanding request
struct CrashRelay {
    scope_key: String,
    state: Arc<Mutex<LifecycleState>>,
    process: Arc<tokio::sync::Mutex<Option<ChildProcessManager>>>,
    rpc: Arc<Mutex<Option<JsonRpcClient>>>,
    exits: broadcast::Sender<ProcessExitEvent>,
}

#[async_trait]
impl ProcessExitHandler for CrashRelay {
    async fn on_process_exit(&self, event: ProcessExitEvent) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                // Exit observed during an intentional stop is not a crash
                LifecycleState::Stopping | LifecycleState::Stopped => return,
                _ => *state = LifecycleState::Crashed,
            }
        }

        warn!(
            "Language server for {} exited unexpectedly (code {:?})",
            self.scope_key, event.code
        );

        self.process.lock().await.take();

        if let Some(rpc) = self.rpc.lock().unwrap().take() {
            rpc.fail_all_pending();
        }

        let _ = self.exits.send(event);
    }
}

impl LanguageClient {
    /// Create a supervisor for the given configuration; does not spawn
    pub fn new(config: ServerConfig) -> Self {
        let (stderr_lines, _) = broadcast::channel(64);
        let (exits, _) = broadcast::channel(4);
        Self {
            config,
            state: Arc::new(Mutex::new(LifecycleState::Stopped)),
            process: Arc::new(tokio::sync::Mutex::new(None)),
            rpc: Arc::new(Mutex::new(None)),
            stderr_lines,
            exits,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap()
    }

    /// True once the handshake has completed and until stop/crash
    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    /// Number of requests currently awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.rpc
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, JsonRpcClient::pending_count)
    }

    /// Subscribe to the server's stderr diagnostics
    pub fn subscribe_stderr(&self) -> broadcast::Receiver<String> {
        self.stderr_lines.subscribe()
    }

    /// Subscribe to unexpected-exit events
    pub fn subscribe_exits(&self) -> broadcast::Receiver<ProcessExitEvent> {
        self.exits.subscribe()
    }

    /// Spawn the server and complete the handshake
    ///
    /// No-op when the server is already starting or running. On handshake
    /// failure the spawned process is terminated before the error
    /// propagates - a failed start never leaks a process.
    pub async fn start(&self, workspace_root: Option<&Path>) -> Result<(), LspError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                LifecycleState::Starting
                | LifecycleState::HandshakePending
                | LifecycleState::Ready => return Ok(()),
                _ => *state = LifecycleState::Starting,
            }
        }

        if let Err(e) = self.start_inner(workspace_root).await {
            if let Some(mut manager) = self.process.lock().await.take() {
                let _ = manager.stop(StopMode::Force).await;
            }
            self.rpc.lock().unwrap().take();
            *self.state.lock().unwrap() = LifecycleState::Stopped;
            return Err(e);
        }
        Ok(())
    }

    async fn start_inner(&self, workspace_root: Option<&Path>) -> Result<(), LspError> {
        info!(
            "Starting language server for {}: {} {:?}",
            self.config.scope_key, self.config.command, self.config.args
        );

        let mut manager = ChildProcessManager::new(
            self.config.command.clone(),
            self.config.args.clone(),
            workspace_root.map(Path::to_path_buf),
            self.config.env.clone(),
        );

        let scope_key = self.config.scope_key.clone();
        let stderr_tx = self.stderr_lines.clone();
        manager.on_stderr_line(move |line| {
            debug!("[{} stderr] {}", scope_key, line);
            let _ = stderr_tx.send(line);
        });

        manager.on_process_exit(Arc::new(CrashRelay {
            scope_key: self.config.scope_key.clone(),
            state: Arc::clone(&self.state),
            process: Arc::clone(&self.process),
            rpc: Arc::clone(&self.rpc),
            exits: self.exits.clone(),
        }));

        manager.start().await?;
        let transport = manager.create_stdio_transport()?;
        *self.process.lock().await = Some(manager);

        let rpc = JsonRpcClient::new(Box::new(transport));
        *self.rpc.lock().unwrap() = Some(rpc.clone());
        {
            // The relay settles pending requests only through the rpc cell;
            // an exit observed before the cell was filled is caught here
            let mut state = self.state.lock().unwrap();
            if *state == LifecycleState::Crashed {
                return Err(LspError::ProcessExited);
            }
            *state = LifecycleState::HandshakePending;
        }

        let result = self.handshake(&rpc, workspace_root).await?;
        let capabilities = result.get("capabilities").cloned().unwrap_or(Value::Null);
        debug!(
            "Server capabilities for {}: {}",
            self.config.scope_key, capabilities
        );

        *self.state.lock().unwrap() = LifecycleState::Ready;
        info!("Language server ready for {}", self.config.scope_key);
        Ok(())
    }

    /// The initialize round trip followed by the initialized notification
    async fn handshake(
        &self,
        rpc: &JsonRpcClient,
        workspace_root: Option<&Path>,
    ) -> Result<Value, LspError> {
        let root = workspace_root
            .map(Path::to_path_buf)
            .or_else(|| std::env::current_dir().ok());

        let result = rpc
            .request_with_timeout(
                "initialize",
                Some(initialize_params(root.as_deref())),
                HANDSHAKE_TIMEOUT,
            )
            .await?;

        if !result.is_object() {
            return Err(LspError::Protocol(format!(
                "initialize result is not an object: {result}"
            )));
        }

        rpc.notify("initialized", Some(json!({}))).await?;
        Ok(result)
    }

    /// Clone the correlator handle, but only while Ready
    fn ready_rpc(&self) -> Option<JsonRpcClient> {
        if self.state() != LifecycleState::Ready {
            return None;
        }
        self.rpc.lock().unwrap().clone()
    }

    /// Low-level request passthrough
    ///
    /// Unlike the typed helpers this does not degrade: callers that reach
    /// for raw methods get told when the server is not usable.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, LspError> {
        let Some(rpc) = self.ready_rpc() else {
            return Err(LspError::NotReady);
        };
        rpc.request(method, params).await
    }

    /// Completion items at a cursor position, or empty when degraded
    pub async fn completions(&self, file_path: &Path, position: CursorPosition) -> Vec<CompletionItem> {
        let Some(rpc) = self.ready_rpc() else {
            return Vec::new();
        };

        let params = text_document_position(file_path, position);
        match rpc.request("textDocument/completion", Some(params)).await {
            Ok(result) => flatten_completions(result),
            Err(e) => {
                warn!("Completion request failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Hover markup at a cursor position, or None when degraded
    pub async fn hover(&self, file_path: &Path, position: CursorPosition) -> Option<Hover> {
        let rpc = self.ready_rpc()?;

        let params = text_document_position(file_path, position);
        match rpc.request("textDocument/hover", Some(params)).await {
            Ok(Value::Null) => None,
            Ok(result) => match serde_json::from_value(result) {
                Ok(hover) => Some(hover),
                Err(e) => {
                    warn!("Malformed hover payload: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("Hover request failed: {}", e);
                None
            }
        }
    }

    /// Definition location(s) for the symbol at a cursor position
    pub async fn definition(
        &self,
        file_path: &Path,
        position: CursorPosition,
    ) -> Option<GotoDefinitionResponse> {
        let rpc = self.ready_rpc()?;

        let params = text_document_position(file_path, position);
        match rpc.request("textDocument/definition", Some(params)).await {
            Ok(Value::Null) => None,
            Ok(result) => match serde_json::from_value(result) {
                Ok(response) => Some(response),
                Err(e) => {
                    warn!("Malformed definition payload: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("Definition request failed: {}", e);
                None
            }
        }
    }

    /// Stop the server: best-effort shutdown, bounded grace, then SIGKILL
    ///
    /// Requests degrade immediately; outstanding requests are settled with
    /// ProcessExited.
    pub async fn stop(&self) -> Result<(), LspError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                LifecycleState::Stopped | LifecycleState::Stopping => return Ok(()),
                _ => *state = LifecycleState::Stopping,
            }
        }

        info!("Stopping language server for {}", self.config.scope_key);

        let rpc = self.rpc.lock().unwrap().take();
        let mut manager = self.process.lock().await.take();
        let mut watch = manager.as_ref().map(ChildProcessManager::state_watch);

        // One grace window covers the whole exchange: shutdown round trip,
        // exit notification, and waiting out the actual process exit
        let graceful = async {
            if let Some(rpc) = &rpc {
                if let Err(e) = rpc
                    .request_with_timeout("shutdown", None, SHUTDOWN_GRACE)
                    .await
                {
                    debug!("Shutdown request not acknowledged: {}", e);
                }
                let _ = rpc.notify("exit", None).await;
            }

            if let Some(watch) = watch.as_mut() {
                while watch.borrow_and_update().is_running() {
                    if watch.changed().await.is_err() {
                        break;
                    }
                }
            }
        };

        if tokio::time::timeout(SHUTDOWN_GRACE, graceful).await.is_err() {
            info!(
                "Server for {} did not exit within grace period, force killing",
                self.config.scope_key
            );
            if let Some(manager) = manager.as_mut() {
                let _ = manager.stop(StopMode::Force).await;
            }
        }

        if let Some(rpc) = rpc {
            rpc.fail_all_pending();
        }

        *self.state.lock().unwrap() = LifecycleState::Stopped;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn attach_rpc_for_test(&self, rpc: JsonRpcClient, state: LifecycleState) {
        *self.rpc.lock().unwrap() = Some(rpc);
        *self.state.lock().unwrap() = state;
    }
}

/// Standard `textDocument`/`position` request parameters
fn text_document_position(file_path: &Path, position: CursorPosition) -> Value {
    json!({
        "textDocument": {"uri": file_uri(file_path)},
        "position": {"line": position.row, "character": position.column}
    })
}

/// The capabilities payload advertised in the initialize request
fn initialize_params(root: Option<&Path>) -> Value {
    json!({
        "processId": std::process::id(),
        "rootPath": root.map(|p| p.display().to_string()),
        "rootUri": root.map(file_uri),
        "capabilities": {
            "textDocument": {
                "completion": {"completionItem": {"snippetSupport": true}},
                "hover": {"contentFormat": ["markdown", "plaintext"]},
                "signatureHelp": {"signatureInformation": {"documentationFormat": ["markdown"]}},
                "definition": {},
                "references": {},
                "documentSymbol": {},
                "formatting": {},
                "rangeFormatting": {},
                "codeAction": {}
            },
            "workspace": {
                "symbol": {},
                "configuration": true
            }
        }
    })
}

/// Normalize a completion result into a flat item list
///
/// Servers return either a bare item array or a CompletionList object; both
/// collapse to the items, anything else to empty.
fn flatten_completions(result: Value) -> Vec<CompletionItem> {
    let items = match result {
        Value::Array(items) => Value::Array(items),
        Value::Object(mut list) => match list.remove("items") {
            Some(items) => items,
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    match serde_json::from_value(items) {
        Ok(items) => items,
        Err(e) => {
            warn!("Malformed completion payload: {}", e);
            Vec::new()
        }
    }
}
