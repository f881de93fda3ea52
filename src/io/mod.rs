//! I/O layer - Generic abstractions for process management and transport
//!
//! This module provides fundamental I/O abstractions that are not specific to
//! any protocol:
//!
//! - **Transport**: Pure I/O layer for bidirectional byte exchange
//! - **Process**: External process lifecycle management with stdio integration
//!
//! The protocol layer (`crate::lsp`) builds message framing and request
//! correlation on top of these.

pub mod process;
pub mod transport;

// Re-export main types for convenience
pub use process::{
    ChildProcessManager, ProcessError, ProcessExitEvent, ProcessExitHandler, ProcessManager,
    ProcessState, StderrMonitor, StopMode,
};
pub use transport::{StdioTransport, Transport, TransportError};
