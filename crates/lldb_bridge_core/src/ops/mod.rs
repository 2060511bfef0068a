//! Command façade: one module per family of debugger operations. Every
//! operation obtains (or creates) the session for a pid, sends one fixed
//! command template, and returns the debugger's text. Nothing here retries.

pub mod breakpoint;
pub mod expression;
pub mod memory;
pub mod process;
pub mod raw;
pub mod stack;
pub mod step;
pub mod symbol;
pub mod thread;
pub mod watchpoint;

use crate::registry::{Connector, SessionRegistry};
use crate::{LldbError, Result};

/// Sends `command` on the session for `pid` and fails if the debugger
/// reported an error.
pub(crate) async fn run<C: Connector>(
    registry: &SessionRegistry<C>,
    pid: u32,
    command: &str,
) -> Result<String> {
    let session = registry.get_or_create(pid).await?;
    let response = session.send_command(command).await?;
    check_response(command, response)
}

/// LLDB prefixes command failures with `error:`; the full text is kept.
pub(crate) fn check_response(command: &str, response: String) -> Result<String> {
    let failed = response
        .lines()
        .any(|line| line.trim_start().starts_with("error:"));
    if failed {
        tracing::debug!("Debugger rejected '{command}'");
        return Err(LldbError::command_failed(command, response));
    }
    Ok(response)
}

pub(crate) fn require_non_empty<'a>(name: &str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LldbError::InvalidParameter(format!("{name} must not be empty")));
    }
    Ok(trimmed)
}

/// Quotes one token for the LLDB command line when it contains whitespace
/// or quoting characters.
pub(crate) fn quote_arg(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | '`'));
    if !needs_quotes {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}
