use crate::list_supported_backend_types;
use anyhow::Result;
use std::io::Write;

/// Print one supported backend per line.
///
/// # Errors
///
/// Returns an error if stdout cannot be written.
pub fn handle() -> Result<()> {
    let mut out = std::io::stdout().lock();
    for backend in list_supported_backend_types() {
        writeln!(out, "{backend}")?;
    }
    Ok(())
}
