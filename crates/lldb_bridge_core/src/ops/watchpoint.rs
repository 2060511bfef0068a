use crate::ops::{require_non_empty, run};
use crate::registry::{Connector, SessionRegistry};
use crate::types::WatchKind;
use crate::{LldbError, Result};

const WATCH_SIZES: [u32; 4] = [1, 2, 4, 8];

pub async fn set_variable<C: Connector>(
    registry: &SessionRegistry<C>,
    pid: u32,
    variable: &str,
    kind: Option<WatchKind>,
) -> Result<String> {
    let variable = require_non_empty("variable", variable)?;
    let mut command = String::from("watchpoint set variable");
    push_kind(&mut command, kind);
    command.push(' ');
    command.push_str(variable);
    run(registry, pid, &command).await
}

/// Watches `size` bytes at an address expression.
pub async fn set_address<C: Connector>(
    registry: &SessionRegistry<C>,
    pid: u32,
    address: &str,
    kind: Option<WatchKind>,
    size: Option<u32>,
) -> Result<String> {
    let address = require_non_empty("address", address)?;
    let mut command = String::from("watchpoint set expression");
    push_kind(&mut command, kind);
    if let Some(size) = size {
        if !WATCH_SIZES.contains(&size) {
            return Err(LldbError::InvalidParameter(format!(
                "watch size must be 1, 2, 4 or 8 bytes, got {size}"
            )));
        }
        command.push_str(&format!(" -s {size}"));
    }
    command.push_str(" -- ");
    command.push_str(address);
    run(registry, pid, &command).await
}

pub async fn delete<C: Connector>(registry: &SessionRegistry<C>, pid: u32, id: u32) -> Result<String> {
    run(registry, pid, &format!("watchpoint delete {id}")).await
}

pub async fn list<C: Connector>(registry: &SessionRegistry<C>, pid: u32) -> Result<String> {
    run(registry, pid, "watchpoint list").await
}

fn push_kind(command: &mut String, kind: Option<WatchKind>) {
    if let Some(kind) = kind {
        command.push_str(" -w ");
        command.push_str(kind.as_lldb_arg());
    }
}
