//! Language Server Protocol client stack
//!
//! Layered bottom-up: `framing` handles Content-Length message boundaries,
//! `jsonrpc` the message shapes, `protocol` request/response correlation
//! over a transport, `client` the per-server lifecycle supervisor, and
//! `registry` the scope-keyed multiplexer editors talk to.

pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod jsonrpc;
pub mod protocol;
pub mod registry;

#[cfg(test)]
pub mod testing;

pub use client::{CursorPosition, LanguageClient, LifecycleState};
pub use config::{ServerConfig, ServerConfigPatch, default_configs};
pub use error::LspError;
pub use protocol::JsonRpcClient;
pub use registry::ServerRegistry;
