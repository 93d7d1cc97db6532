//! `burrow logs` — Print a background container's captured output.

use burrow_runtime::engine::Engine;
use clap::Args;

/// Arguments for the `logs` command.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Container name.
    pub container: String,
}

/// Executes the `logs` command.
///
/// # Errors
///
/// Returns an error if the container is unknown or its log is unreadable.
pub fn execute(engine: &Engine, args: &LogsArgs) -> anyhow::Result<()> {
    let logs = engine.logs(&args.container).map_err(|e| anyhow::anyhow!("{e}"))?;
    print!("{logs}");
    Ok(())
}
