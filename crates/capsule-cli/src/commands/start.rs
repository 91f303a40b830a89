//! `capsule start`: Release a created container into its command.

use capsule_common::types::Status;
use clap::Args;

use super::Context;

/// Arguments for the `start` command.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Container id.
    pub id: String,
}

/// Executes the `start` command.
///
/// # Errors
///
/// Returns an error unless the container is Created.
pub fn execute(args: &StartArgs, ctx: &Context) -> anyhow::Result<()> {
    let container = ctx.container(&args.id)?;
    match container.status()? {
        Status::Created => Ok(container.start()?),
        Status::Stopped => anyhow::bail!("cannot start a container that has stopped"),
        Status::Running => anyhow::bail!("cannot start an already running container"),
    }
}
