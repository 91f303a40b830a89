//! `capsule delete`: Delete a container.

use anyhow::Context as _;
use capsule_common::constants::{DESTROY_POLL_ATTEMPTS, POLL_INTERVAL};
use capsule_common::types::Status;
use capsule_image::store::ImageStore;
use capsule_runtime::container::Container;
use clap::Args;
use nix::sys::signal::Signal;

use super::Context;
use super::image::IMAGE_LABEL;

/// Arguments for the `delete` command.
#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Container id.
    pub id: String,

    /// Kill a running container with SIGKILL before deleting it.
    #[arg(short, long)]
    pub force: bool,
}

/// Executes the `delete` command.
///
/// A container started from an image also loses its overlay rootfs.
///
/// # Errors
///
/// Returns an error if the container is running (without `--force`),
/// does not stop in time, or cannot be destroyed.
pub fn execute(args: &DeleteArgs, ctx: &Context) -> anyhow::Result<()> {
    let container = ctx.container(&args.id)?;
    remove(ctx, &container, args.force)
}

/// Destroys `container`, killing it first when `force` is set, and
/// cleans up an image rootfs it was started from.
///
/// # Errors
///
/// Returns an error if the container is running (without `force`),
/// does not stop in time, or cannot be destroyed.
pub fn remove(ctx: &Context, container: &Container, force: bool) -> anyhow::Result<()> {
    let id = container.id().to_string();
    if force && container.status()? == Status::Running {
        kill_and_wait(container)?;
    }
    container.destroy()?;

    if container.config().labels.contains_key(IMAGE_LABEL) {
        ImageStore::open(ctx.runtime.images_dir())?
            .cleanup(&id)
            .with_context(|| format!("clean up image rootfs of {id}"))?;
    }
    tracing::info!(id = %id, "container deleted");
    Ok(())
}

fn kill_and_wait(container: &Container) -> anyhow::Result<()> {
    container.signal(Signal::SIGKILL)?;
    for _ in 0..DESTROY_POLL_ATTEMPTS {
        if container.status()? != Status::Running {
            return Ok(());
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    anyhow::bail!("timed out waiting for container {} to die", container.id())
}
