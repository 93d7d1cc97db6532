//! `burrow ps` — List containers.

use burrow_common::types::ContainerStatus;
use burrow_runtime::engine::Engine;
use clap::Args;

use crate::output::Table;

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Show all containers (including stopped and exited).
    #[arg(short, long)]
    pub all: bool,
}

/// Executes the `ps` command.
///
/// # Errors
///
/// Returns an error if the container records cannot be read.
pub fn execute(engine: &Engine, args: &PsArgs) -> anyhow::Result<()> {
    let containers = engine.list().map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut table = Table::new(&["ID", "NAME", "PID", "STATUS", "COMMAND", "CREATED"]);
    for c in containers
        .into_iter()
        .filter(|c| args.all || c.status == ContainerStatus::Running)
    {
        table.row(vec![
            c.id.to_string(),
            c.name,
            c.pid,
            c.status.to_string(),
            c.command,
            c.created_time,
        ]);
    }
    print!("{}", table.render());

    Ok(())
}
