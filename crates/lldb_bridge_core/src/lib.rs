//! LLDB Bridge Core
//!
//! Drives interactive LLDB processes through a pseudo-terminal, framing each
//! command's output by the debugger's idle prompt. Provides a registry of
//! per-target sessions, the attach and launch strategies that create them,
//! and a set of high-level debugging operations.

pub mod config;
pub mod error;
pub mod launch;
pub mod ops;
pub mod pty;
pub mod registry;
pub mod session;
pub mod transcript;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::LldbConfig;
pub use error::LldbError;
pub use launch::{AppLauncher, LldbConnector, SystemLauncher};
pub use registry::{Connector, SessionRegistry};
pub use session::{FramedSession, SessionHandle};

/// Result type alias using LldbError
pub type Result<T> = std::result::Result<T, LldbError>;
