//! CLI command definitions and dispatch.

pub mod exec;
pub mod init;
pub mod logs;
pub mod network;
pub mod ps;
pub mod rm;
pub mod run;
pub mod stop;

use std::path::PathBuf;

use burrow_common::config::{BurrowConfig, RuntimePaths};
use burrow_runtime::engine::Engine;
use clap::{Parser, Subcommand};

/// Burrow — Daemon-less container runtime.
#[derive(Parser, Debug)]
#[command(name = "burrow", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// JSON configuration file; a missing file means defaults.
    #[arg(long, global = true, env = "BURROW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Re-base all state, workspace, image and network directories under DIR.
    #[arg(long, global = true, env = "BURROW_ROOT", value_name = "DIR")]
    pub root: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a command in a new container.
    Run(run::RunArgs),
    /// Container-side bootstrap; started by `run`, not by users.
    #[command(hide = true)]
    Init,
    /// List containers.
    Ps(ps::PsArgs),
    /// Print the captured output of a background container.
    Logs(logs::LogsArgs),
    /// Stop a running container.
    Stop(stop::StopArgs),
    /// Remove a container and everything it holds.
    Rm(rm::RmArgs),
    /// Execute a command inside a running container.
    Exec(exec::ExecArgs),
    /// Manage bridge networks.
    #[command(subcommand)]
    Network(network::NetworkCommand),
}

impl Cli {
    /// Builds the runtime configuration from `--config` and `--root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but is invalid.
    pub fn runtime_config(&self) -> anyhow::Result<BurrowConfig> {
        let mut config = match &self.config {
            Some(path) => BurrowConfig::load(path).map_err(|e| anyhow::anyhow!("{e}"))?,
            None => BurrowConfig::default(),
        };
        if let Some(root) = &self.root {
            let cgroup_root = std::mem::take(&mut config.paths.cgroup_root);
            config.paths = RuntimePaths {
                cgroup_root,
                ..RuntimePaths::under(root)
            };
        }
        Ok(config)
    }
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: &Cli) -> anyhow::Result<()> {
    if matches!(cli.command, Command::Init) {
        return init::execute();
    }

    let engine = Engine::new(cli.runtime_config()?);
    match &cli.command {
        Command::Run(args) => run::execute(&engine, args),
        Command::Init => init::execute(),
        Command::Ps(args) => ps::execute(&engine, args),
        Command::Logs(args) => logs::execute(&engine, args),
        Command::Stop(args) => stop::execute(&engine, args),
        Command::Rm(args) => rm::execute(&engine, args),
        Command::Exec(args) => exec::execute(&engine, args),
        Command::Network(command) => network::execute(&engine, command),
    }
}
