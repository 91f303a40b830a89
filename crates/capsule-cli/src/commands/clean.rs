//! `capsule clean`: Remove every runtime file under the root.

use anyhow::Context as _;
use capsule_common::error::ErrorKind;
use capsule_runtime::factory::Factory;
use clap::Args;

use super::Context;
use super::delete::remove;

/// Arguments for the `clean` command.
#[derive(Args, Debug)]
pub struct CleanArgs {
    /// Delete existing containers (killing running ones) instead of
    /// refusing to clean.
    #[arg(short, long)]
    pub force: bool,
}

/// Executes the `clean` command.
///
/// Containers, bridges, address allocations and images all live under the
/// runtime root, which is removed as a whole.
///
/// # Errors
///
/// Returns an error if containers exist and `--force` is not given, if a
/// container cannot be deleted, or if the root cannot be removed.
pub fn execute(args: &CleanArgs, ctx: &Context) -> anyhow::Result<()> {
    let root = &ctx.runtime.root;
    if !root.exists() {
        return Ok(());
    }
    let factory = ctx.factory()?;
    let ids = factory.ids()?;
    if !ids.is_empty() && !args.force {
        anyhow::bail!(
            "{} container(s) still exist ({}); use --force to delete them",
            ids.len(),
            ids.join(", ")
        );
    }

    for id in &ids {
        match factory.load(id) {
            Ok(container) => remove(ctx, &container, true)
                .with_context(|| format!("delete container {id}"))?,
            Err(e) if e.kind() == ErrorKind::ContainerNotExists => {
                tracing::warn!(id = %id, "container without state, removing its files only");
            }
            Err(e) => return Err(e).with_context(|| format!("load container {id}")),
        }
    }
    remove_networks(&factory);

    std::fs::remove_dir_all(root)
        .with_context(|| format!("remove runtime root {}", root.display()))?;
    tracing::info!(root = %root.display(), "runtime files removed");
    Ok(())
}

/// Tears down every recorded network. Failures leave the kernel objects
/// behind but do not stop the clean.
fn remove_networks(factory: &Factory) {
    let driver = match factory.network_driver() {
        Ok(driver) => driver,
        Err(e) => {
            tracing::warn!(error = %e, "network driver unavailable, networks not torn down");
            return;
        }
    };
    let networks = match driver.list() {
        Ok(networks) => networks,
        Err(e) => {
            tracing::warn!(error = %e, "failed to list networks");
            return;
        }
    };
    for network in networks {
        if let Err(e) = driver.delete(&network.name) {
            tracing::warn!(network = %network.name, error = %e, "failed to delete network");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use capsule_common::config::{ContainerConfig, RuntimeConfig};

    use super::*;

    fn context(root: &Path) -> Context {
        Context {
            runtime: RuntimeConfig::with_root(root),
        }
    }

    fn register(ctx: &Context, id: &str) {
        let rootfs = ctx.runtime.root.join("rootfs-src");
        std::fs::create_dir_all(&rootfs).unwrap();
        let config = ContainerConfig {
            rootfs,
            ..ContainerConfig::default()
        };
        let container = ctx.factory().unwrap().create(id, config).unwrap();
        container.state().unwrap().save(container.root()).unwrap();
    }

    #[test]
    fn refuses_while_containers_exist() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir.path().join("run"));
        register(&ctx, "web");

        let err = execute(&CleanArgs { force: false }, &ctx).unwrap_err();
        assert!(err.to_string().contains("web"));
        assert!(ctx.runtime.container_root("web").exists());
    }

    #[test]
    fn force_deletes_containers_and_root() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir.path().join("run"));
        register(&ctx, "web");
        std::fs::create_dir_all(ctx.runtime.container_root("stale")).unwrap();
        std::fs::create_dir_all(ctx.runtime.ipam_path().parent().unwrap()).unwrap();
        std::fs::write(ctx.runtime.ipam_path(), "{}").unwrap();

        execute(&CleanArgs { force: true }, &ctx).unwrap();
        assert!(!ctx.runtime.root.exists());
    }

    #[test]
    fn empty_runtime_is_removed_and_missing_root_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir.path().join("run"));
        let _ = ctx.factory().unwrap();

        execute(&CleanArgs { force: false }, &ctx).unwrap();
        assert!(!ctx.runtime.root.exists());
        execute(&CleanArgs { force: false }, &ctx).unwrap();
    }
}
