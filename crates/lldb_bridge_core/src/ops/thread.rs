use crate::ops::run;
use crate::registry::{Connector, SessionRegistry};
use crate::Result;

pub async fn list<C: Connector>(registry: &SessionRegistry<C>, pid: u32) -> Result<String> {
    run(registry, pid, "thread list").await
}

/// Selects a thread by its LLDB index (the `#N` in `thread list`).
pub async fn select<C: Connector>(registry: &SessionRegistry<C>, pid: u32, index: u32) -> Result<String> {
    run(registry, pid, &format!("thread select {index}")).await
}
