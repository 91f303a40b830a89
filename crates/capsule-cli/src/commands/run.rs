//! `capsule run`: Create and start a container.

use clap::Args;

use super::Context;
use super::create::{Action, LaunchArgs, launch};

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Container id.
    pub id: String,

    /// Return once the container is started; output goes to its log.
    #[arg(short, long)]
    pub detach: bool,

    #[command(flatten)]
    pub launch: LaunchArgs,
}

/// Executes the `run` command.
///
/// Returns the container's exit code when running in the foreground.
///
/// # Errors
///
/// Returns an error if the bundle is invalid or the launch fails.
pub fn execute(args: RunArgs, ctx: &Context) -> anyhow::Result<Option<i32>> {
    let (config, process) = args.launch.configs()?;
    launch(ctx, &args.id, config, process, Action::Run { detach: args.detach })
}
