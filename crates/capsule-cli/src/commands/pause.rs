//! `capsule pause` and `capsule resume`: Freeze and thaw a container.

use clap::Args;

use super::Context;

/// Arguments for the `pause` and `resume` commands.
#[derive(Args, Debug)]
pub struct PauseArgs {
    /// Container id.
    pub id: String,
}

/// Executes the `pause` command.
///
/// # Errors
///
/// Returns an error if the container is not running or has no freezer
/// cgroup.
pub fn pause(args: &PauseArgs, ctx: &Context) -> anyhow::Result<()> {
    ctx.container(&args.id)?.pause()?;
    Ok(())
}

/// Executes the `resume` command.
///
/// # Errors
///
/// Returns an error if the container is not running or has no freezer
/// cgroup.
pub fn resume(args: &PauseArgs, ctx: &Context) -> anyhow::Result<()> {
    ctx.container(&args.id)?.resume()?;
    Ok(())
}
