use crate::ops::{require_non_empty, run};
use crate::registry::{Connector, SessionRegistry};
use crate::{LldbError, Result};

/// Reads target memory at an address expression. `format` is an LLDB format
/// name such as `x`, `bytes` or `c-string`.
pub async fn read<C: Connector>(
    registry: &SessionRegistry<C>,
    pid: u32,
    address: &str,
    format: Option<&str>,
    count: Option<u32>,
) -> Result<String> {
    let address = require_non_empty("address", address)?;

    let mut command = String::from("memory read");
    if let Some(format) = format.map(str::trim).filter(|f| !f.is_empty()) {
        if format.contains(char::is_whitespace) {
            return Err(LldbError::InvalidParameter(format!(
                "format must be a single word, got '{format}'"
            )));
        }
        command.push_str(&format!(" --format {format}"));
    }
    if let Some(count) = count {
        if count == 0 {
            return Err(LldbError::InvalidParameter("count must be at least 1".into()));
        }
        command.push_str(&format!(" --count {count}"));
    }
    command.push(' ');
    command.push_str(address);

    run(registry, pid, &command).await
}
