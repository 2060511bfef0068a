use crate::ops::{quote_arg, require_non_empty, run};
use crate::registry::{Connector, SessionRegistry};
use crate::{LldbError, Result};

pub async fn set_by_name<C: Connector>(
    registry: &SessionRegistry<C>,
    pid: u32,
    name: &str,
    condition: Option<&str>,
) -> Result<String> {
    let name = require_non_empty("name", name)?;
    let command = with_condition(format!("breakpoint set --name {}", quote_arg(name)), condition);
    run(registry, pid, &command).await
}

pub async fn set_by_location<C: Connector>(
    registry: &SessionRegistry<C>,
    pid: u32,
    file: &str,
    line: u32,
    condition: Option<&str>,
) -> Result<String> {
    let file = require_non_empty("file", file)?;
    if line == 0 {
        return Err(LldbError::InvalidParameter("line numbers start at 1".into()));
    }
    let command = with_condition(
        format!("breakpoint set --file {} --line {line}", quote_arg(file)),
        condition,
    );
    run(registry, pid, &command).await
}

pub async fn delete<C: Connector>(registry: &SessionRegistry<C>, pid: u32, id: u32) -> Result<String> {
    run(registry, pid, &format!("breakpoint delete {id}")).await
}

pub async fn list<C: Connector>(registry: &SessionRegistry<C>, pid: u32) -> Result<String> {
    run(registry, pid, "breakpoint list").await
}

fn with_condition(mut command: String, condition: Option<&str>) -> String {
    if let Some(condition) = condition.map(str::trim).filter(|c| !c.is_empty()) {
        command.push_str(" --condition ");
        command.push_str(&quote_arg(condition));
    }
    command
}
