use crate::ops::run;
use crate::registry::{Connector, SessionRegistry};
use crate::{LldbError, Result};

pub async fn status<C: Connector>(registry: &SessionRegistry<C>, pid: u32) -> Result<String> {
    run(registry, pid, "process status").await
}

/// Output the debugger printed between commands, such as the stop report
/// that follows a resume. Does not create a session.
pub async fn pending_output<C: Connector>(registry: &SessionRegistry<C>, pid: u32) -> Result<String> {
    let session = registry
        .get(pid)
        .await
        .ok_or_else(|| LldbError::no_session_for_pid(pid))?;
    session.take_unsolicited_output().await
}
