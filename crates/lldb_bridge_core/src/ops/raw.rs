use crate::ops::require_non_empty;
use crate::registry::{Connector, SessionRegistry};
use crate::Result;

/// Sends an arbitrary command line. With `wait` the response text is
/// returned as-is, including any `error:` lines; without it the command is
/// written and a confirmation returned.
pub async fn raw<C: Connector>(
    registry: &SessionRegistry<C>,
    pid: u32,
    command: &str,
    wait: bool,
) -> Result<String> {
    let command = require_non_empty("command", command)?;
    let session = registry.get_or_create(pid).await?;
    if wait {
        session.send_command(command).await
    } else {
        session.send_command_no_wait(command).await?;
        Ok(format!("Sent '{command}' to process {pid}"))
    }
}
