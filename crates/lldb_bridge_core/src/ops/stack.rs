use crate::ops::{require_non_empty, run};
use crate::registry::{Connector, SessionRegistry};
use crate::{LldbError, Result};

/// Backtrace of the selected thread, or of every thread when `all_threads`
/// is set. `count` limits the number of frames.
pub async fn backtrace<C: Connector>(
    registry: &SessionRegistry<C>,
    pid: u32,
    count: Option<u32>,
    all_threads: bool,
) -> Result<String> {
    let mut command = String::from("thread backtrace");
    if let Some(count) = count {
        command.push_str(&format!(" --count {count}"));
    }
    if all_threads {
        command.push_str(" all");
    }
    run(registry, pid, &command).await
}

pub async fn select_frame<C: Connector>(registry: &SessionRegistry<C>, pid: u32, index: u32) -> Result<String> {
    run(registry, pid, &format!("frame select {index}")).await
}

/// Locals and arguments of the selected frame, optionally limited to `names`.
pub async fn variables<C: Connector>(
    registry: &SessionRegistry<C>,
    pid: u32,
    names: &[String],
) -> Result<String> {
    let mut command = String::from("frame variable");
    for name in names {
        let name = require_non_empty("variable name", name)?;
        if name.contains(char::is_whitespace) {
            return Err(LldbError::InvalidParameter(format!(
                "variable name '{name}' contains whitespace"
            )));
        }
        command.push(' ');
        command.push_str(name);
    }
    run(registry, pid, &command).await
}
