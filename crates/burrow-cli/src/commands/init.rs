//! `burrow init` — First process of a container.

/// Executes the hidden `init` command.
///
/// Never returns on success: the process becomes the container's command.
///
/// # Errors
///
/// Returns an error if the command could not be received or started.
pub fn execute() -> anyhow::Result<()> {
    match burrow_runtime::init::run_container_init() {
        Ok(never) => match never {},
        Err(e) => Err(anyhow::anyhow!("container init failed: {e}")),
    }
}
