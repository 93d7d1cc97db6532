//! `burrow exec` — Execute a command inside a running container.

use burrow_runtime::engine::Engine;
use clap::Args;

/// Arguments for the `exec` command.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Container name.
    pub container: String,

    /// Command to execute.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

/// Executes the `exec` command.
///
/// Joins the target container's namespaces and runs the specified
/// command, forwarding stdout/stderr and its exit code.
///
/// # Errors
///
/// Returns an error if the container is not running or namespace joining fails.
pub fn execute(engine: &Engine, args: &ExecArgs) -> anyhow::Result<()> {
    let output = engine
        .exec(&args.container, &args.command)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    print!("{}", output.stdout);
    eprint!("{}", output.stderr);

    if output.exit_code != 0 {
        std::process::exit(output.exit_code);
    }
    Ok(())
}
