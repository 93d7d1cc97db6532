//! `burrow rm` — Remove a container and everything it holds.

use burrow_runtime::engine::Engine;
use clap::Args;

/// Arguments for the `rm` command.
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Container name.
    pub container: String,

    /// Kill the container first if it is still running.
    #[arg(short, long)]
    pub force: bool,
}

/// Executes the `rm` command.
///
/// # Errors
///
/// Returns an error if the container is unknown, or still running and
/// `--force` was not given.
pub fn execute(engine: &Engine, args: &RmArgs) -> anyhow::Result<()> {
    engine
        .remove(&args.container, args.force)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("{}", args.container);
    Ok(())
}
