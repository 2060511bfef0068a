use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LldbError {
    #[error("Failed to allocate pseudo-terminal: {0}")]
    Bridge(#[from] nix::Error),

    #[error("Failed to start debugger at '{}': {source}", .path.display())]
    ProcessStart {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Debugger command '{command}' failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("Timed out after {timeout:?} waiting for the debugger prompt. Partial output: {partial:?}")]
    Timeout { timeout: Duration, partial: String },

    #[error("{}", poisoned_message(.pid))]
    Poisoned { pid: Option<u32> },

    #[error("No active debugger session for {0}")]
    NoActiveSession(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unexpected debugger output: {0}")]
    UnexpectedOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn poisoned_message(pid: &Option<u32>) -> String {
    let target = pid
        .map(|pid| format!("pid {pid}"))
        .unwrap_or_else(|| "an unresolved target".to_string());
    format!(
        "Debugger session for {target} is poisoned after a command timeout and cannot be reused. \
         Re-issue the request to start a fresh session."
    )
}

impl LldbError {
    pub fn command_failed(command: impl Into<String>, output: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            output: output.into(),
        }
    }

    pub fn no_session_for_pid(pid: u32) -> Self {
        Self::NoActiveSession(format!("pid {pid}"))
    }

    pub fn no_session_for_bundle(bundle_id: &str) -> Self {
        Self::NoActiveSession(format!("bundle id '{bundle_id}'"))
    }

    /// Whether the failing session must be discarded rather than reused.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Poisoned { .. })
    }
}
