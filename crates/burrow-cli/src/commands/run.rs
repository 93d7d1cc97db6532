//! `burrow run` — Run a command in a new container.

use burrow_common::types::ResourceConfig;
use burrow_runtime::engine::Engine;
use burrow_runtime::launcher::LaunchOptions;
use clap::Args;

use crate::output::{BOLD, DIM, GREEN, RESET, YELLOW};

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Share the terminal and wait for the container to exit.
    #[arg(short, long, conflicts_with = "detach")]
    pub tty: bool,

    /// Run in the background with output captured to the container log (default).
    #[arg(short, long)]
    pub detach: bool,

    /// Memory limit, e.g. `100m` or `1GiB`.
    #[arg(short, long, value_name = "LIMIT")]
    pub mem: Option<String>,

    /// CPU share in `cpu.shares` units (2..262144).
    #[arg(long, value_name = "SHARES")]
    pub cpu: Option<String>,

    /// Bind a host directory into the container.
    #[arg(short, long, value_name = "HOST:CONTAINER")]
    pub volume: Option<String>,

    /// Container name; defaults to the generated id.
    #[arg(long)]
    pub name: Option<String>,

    /// Attach the container to this network.
    #[arg(long, value_name = "NETWORK")]
    pub net: Option<String>,

    /// Set an environment variable in the container.
    #[arg(short, long, value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Forward a host port to a container port; requires `--net`.
    #[arg(short, long, value_name = "HOST:CONTAINER", requires = "net")]
    pub publish: Vec<String>,

    /// Image to build the root filesystem from.
    pub image: String,

    /// Command to run.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            tty: self.tty,
            name: self.name.clone(),
            resources: ResourceConfig {
                memory_limit: self.mem.clone().unwrap_or_default(),
                cpu_share: self.cpu.clone().unwrap_or_default(),
            },
            volume: self.volume.clone(),
            network: self.net.clone(),
            env: self.env.clone(),
            port_mappings: self.publish.clone(),
        }
    }
}

/// Executes the `run` command.
///
/// In foreground mode the process exits with the container's exit code.
///
/// # Errors
///
/// Returns an error if the container could not be started.
pub fn execute(engine: &Engine, args: &RunArgs) -> anyhow::Result<()> {
    let options = args.launch_options();
    if options.tty {
        // Interrupts are for the container; the launcher must survive to
        // tear it down.
        ctrlc::set_handler(|| {}).map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;
    }

    let report = engine
        .launch(&options, &args.image, &args.command)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    for problem in &report.degraded {
        eprintln!("  {YELLOW}Warning:{RESET} {problem}");
    }

    match report.exit_code {
        Some(0) => Ok(()),
        Some(code) => std::process::exit(code),
        None => {
            eprintln!(
                "  {GREEN}●{RESET} {BOLD}{}{RESET} {DIM}[{}] pid {}{RESET}",
                report.record.name, report.record.id, report.record.pid
            );
            println!("{}", report.record.name);
            Ok(())
        }
    }
}
