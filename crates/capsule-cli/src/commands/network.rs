//! `capsule network`: Manage networks.

use capsule_common::constants::BRIDGE_DRIVER;
use capsule_core::network::{NetworkDriver, driver_by_name};
use clap::{Args, Subcommand};

use super::Context;
use crate::output::Table;

/// Arguments for the `network` command.
#[derive(Args, Debug)]
pub struct NetworkArgs {
    /// Network operation.
    #[command(subcommand)]
    pub command: NetworkCommand,

    /// Network driver.
    #[arg(long, global = true, default_value = BRIDGE_DRIVER)]
    pub driver: String,
}

/// Network operations.
#[derive(Subcommand, Debug)]
pub enum NetworkCommand {
    /// Create a network and its bridge.
    Create {
        /// Network name, also the bridge interface name.
        name: String,
        /// Subnet in CIDR notation.
        #[arg(long)]
        subnet: String,
    },
    /// Delete a network and its bridge.
    Delete {
        /// Network name.
        name: String,
    },
    /// List networks.
    List,
    /// Print one network as JSON.
    Show {
        /// Network name.
        name: String,
    },
}

fn driver(args: &NetworkArgs, ctx: &Context) -> anyhow::Result<Box<dyn NetworkDriver>> {
    let factory = ctx.factory()?;
    Ok(driver_by_name(
        &args.driver,
        ctx.runtime.networks_dir(),
        factory.ipam(),
    )?)
}

/// Executes the `network` command.
///
/// # Errors
///
/// Returns an error if the driver is unknown or the operation fails.
pub fn execute(args: NetworkArgs, ctx: &Context) -> anyhow::Result<()> {
    let driver = driver(&args, ctx)?;
    match args.command {
        NetworkCommand::Create { name, subnet } => {
            let network = driver.create(&subnet, &name)?;
            tracing::info!(name = %network.name, gateway = %network.gateway, "network created");
        }
        NetworkCommand::Delete { name } => driver.delete(&name)?,
        NetworkCommand::List => {
            let mut table = Table::new(&["NAME", "GATEWAY", "SUBNET", "DRIVER"]);
            for network in driver.list()? {
                table.row(vec![
                    network.name,
                    network.gateway.to_string(),
                    network.subnet.to_string(),
                    network.driver,
                ]);
            }
            table.print();
        }
        NetworkCommand::Show { name } => {
            let network = driver.load(&name)?;
            println!("{}", serde_json::to_string_pretty(&network)?);
        }
    }
    Ok(())
}
