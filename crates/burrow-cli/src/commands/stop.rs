//! `burrow stop` — Stop a running container.

use burrow_runtime::engine::Engine;
use clap::Args;

/// Arguments for the `stop` command.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// Container name.
    pub container: String,
}

/// Executes the `stop` command.
///
/// Sends SIGTERM, then SIGKILL once the grace period has passed. The
/// container's files stay in place until `rm`.
///
/// # Errors
///
/// Returns an error if the container is unknown or not running.
pub fn execute(engine: &Engine, args: &StopArgs) -> anyhow::Result<()> {
    let record = engine.stop(&args.container).map_err(|e| anyhow::anyhow!("{e}"))?;
    tracing::info!(name = %record.name, "container stopped");
    println!("{}", record.name);
    Ok(())
}
