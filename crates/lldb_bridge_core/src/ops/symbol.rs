use crate::ops::{quote_arg, require_non_empty, run};
use crate::registry::{Connector, SessionRegistry};
use crate::{LldbError, Result};

/// Looks up symbols whose names match a regular expression in every loaded image.
pub async fn lookup_symbol<C: Connector>(
    registry: &SessionRegistry<C>,
    pid: u32,
    pattern: &str,
) -> Result<String> {
    let pattern = require_non_empty("symbol", pattern)?;
    run(
        registry,
        pid,
        &format!("image lookup --regex --symbol {}", quote_arg(pattern)),
    )
    .await
}

pub async fn lookup_address<C: Connector>(
    registry: &SessionRegistry<C>,
    pid: u32,
    address: &str,
) -> Result<String> {
    let address = require_non_empty("address", address)?;
    if address.contains(char::is_whitespace) {
        return Err(LldbError::InvalidParameter(format!(
            "address '{address}' contains whitespace"
        )));
    }
    run(registry, pid, &format!("image lookup --address {address}")).await
}
