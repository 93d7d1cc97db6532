//! `burrow network` — Manage bridge networks.

use burrow_runtime::engine::Engine;
use clap::{Args, Subcommand};

use crate::output::Table;

/// Network subcommands.
#[derive(Subcommand, Debug)]
pub enum NetworkCommand {
    /// Create a bridge network.
    Create(CreateArgs),
    /// List networks.
    Ls,
    /// Remove a network with no attached containers.
    Rm(RmArgs),
}

/// Arguments for `network create`.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Network name; also the bridge device name.
    pub name: String,

    /// Address range in CIDR notation.
    #[arg(long, value_name = "CIDR")]
    pub subnet: String,
}

/// Arguments for `network rm`.
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Network name.
    pub name: String,
}

/// Executes a `network` subcommand.
///
/// # Errors
///
/// Returns an error if the network operation fails.
pub fn execute(engine: &Engine, command: &NetworkCommand) -> anyhow::Result<()> {
    match command {
        NetworkCommand::Create(args) => {
            let network = engine
                .create_network(&args.name, &args.subnet)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{}", network.name);
        }
        NetworkCommand::Ls => {
            let networks = engine.list_networks().map_err(|e| anyhow::anyhow!("{e}"))?;
            let mut table = Table::new(&["NAME", "SUBNET", "GATEWAY", "DRIVER"]);
            for n in networks {
                table.row(vec![n.name, n.subnet.to_string(), n.gateway.to_string(), n.driver]);
            }
            print!("{}", table.render());
        }
        NetworkCommand::Rm(args) => {
            engine
                .remove_network(&args.name)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{}", args.name);
        }
    }
    Ok(())
}
