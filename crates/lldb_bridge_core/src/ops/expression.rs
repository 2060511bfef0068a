use crate::ops::{require_non_empty, run};
use crate::registry::{Connector, SessionRegistry};
use crate::{LldbError, Result};

/// Evaluates an expression in the selected frame.
pub async fn evaluate<C: Connector>(
    registry: &SessionRegistry<C>,
    pid: u32,
    expression: &str,
) -> Result<String> {
    let expression = require_non_empty("expression", expression)?;
    run(registry, pid, &format!("expression -- {expression}")).await
}

/// Reads the named registers, or the general purpose set when none are given.
pub async fn read_registers<C: Connector>(
    registry: &SessionRegistry<C>,
    pid: u32,
    names: &[String],
) -> Result<String> {
    let mut command = String::from("register read");
    for name in names {
        let name = require_non_empty("register name", name)?;
        if name.contains(char::is_whitespace) {
            return Err(LldbError::InvalidParameter(format!(
                "register name '{name}' contains whitespace"
            )));
        }
        command.push(' ');
        command.push_str(name);
    }
    run(registry, pid, &command).await
}
