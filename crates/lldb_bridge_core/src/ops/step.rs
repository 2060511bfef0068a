use crate::ops::run;
use crate::registry::{Connector, SessionRegistry};
use crate::types::StepKind;
use crate::Result;

const RESUME_COMMAND: &str = "process continue";

impl StepKind {
    fn command(self) -> &'static str {
        match self {
            Self::Over => "thread step-over",
            Self::Into => "thread step-in",
            Self::Out => "thread step-out",
            Self::Instruction => "thread step-inst",
        }
    }
}

/// Steps the selected thread. The debugger prints the new stop location
/// followed by its prompt, so this waits like any other command.
pub async fn step<C: Connector>(registry: &SessionRegistry<C>, pid: u32, kind: StepKind) -> Result<String> {
    run(registry, pid, kind.command()).await
}

/// Resumes the target without waiting. The debugger stays silent until the
/// target stops again; that stop report is picked up by the next command or
/// by [`crate::ops::process::pending_output`].
pub async fn resume<C: Connector>(registry: &SessionRegistry<C>, pid: u32) -> Result<String> {
    let session = registry.get_or_create(pid).await?;
    session.send_command_no_wait(RESUME_COMMAND).await?;
    Ok(format!("Process {pid} resumed"))
}

pub async fn interrupt<C: Connector>(registry: &SessionRegistry<C>, pid: u32) -> Result<String> {
    run(registry, pid, "process interrupt").await
}
