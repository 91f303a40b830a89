//! `capsule create`: Create a container from a bundle.
//!
//! Also hosts the launch path shared by `run` and `image run`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context as _;
use capsule_common::config::{ContainerConfig, ProcessConfig};
use capsule_runtime::bundle::{Spec, endpoint_config};
use capsule_runtime::container::Container;
use capsule_runtime::parent::send_signal;
use clap::Args;
use nix::sys::signal::Signal;

use super::Context;

/// Arguments for the `create` command.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Container id.
    pub id: String,

    #[command(flatten)]
    pub launch: LaunchArgs,
}

/// Bundle and network options shared by `create` and `run`.
#[derive(Args, Debug)]
pub struct LaunchArgs {
    /// Bundle directory holding config.json; defaults to the current
    /// directory.
    #[arg(short, long)]
    pub bundle: Option<PathBuf>,

    /// Network to connect the container to.
    #[arg(long, alias = "net")]
    pub network: Option<String>,

    /// Port mapping `hostPort:containerPort`; needs `--network`.
    #[arg(short, long = "port", requires = "network")]
    pub ports: Vec<String>,
}

impl LaunchArgs {
    /// Loads the bundle and applies the network options.
    ///
    /// # Errors
    ///
    /// Returns an error if the bundle cannot be read or converted.
    pub fn configs(&self) -> anyhow::Result<(ContainerConfig, ProcessConfig)> {
        let bundle = match &self.bundle {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("resolve current directory")?,
        };
        let bundle = std::path::absolute(&bundle)
            .with_context(|| format!("resolve bundle {}", bundle.display()))?;
        let (mut config, process) = Spec::load(&bundle)?.to_configs(&bundle)?;
        if let Some(network) = &self.network {
            config.endpoints = vec![endpoint_config(network, self.ports.clone())];
        }
        Ok((config, process))
    }
}

/// What to do after the container is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Leave the init process blocked before the user command.
    Create,
    /// Start the user command, waiting for it unless detached.
    Run {
        /// Return once started; output goes to the container log.
        detach: bool,
    },
}

/// Executes the `create` command.
///
/// # Errors
///
/// Returns an error if the bundle is invalid or the launch fails.
pub fn execute(args: CreateArgs, ctx: &Context) -> anyhow::Result<()> {
    let (config, process) = args.launch.configs()?;
    let _ = launch(ctx, &args.id, config, process, Action::Create)?;
    Ok(())
}

/// Registers a container and launches its init process. A container whose
/// launch fails is removed again.
///
/// # Errors
///
/// Returns an error if registration or any launch step fails.
pub fn launch(
    ctx: &Context,
    id: &str,
    config: ContainerConfig,
    mut process: ProcessConfig,
    action: Action,
) -> anyhow::Result<Option<i32>> {
    let factory = ctx.factory()?;
    let container = factory.create(id, config)?;
    process.init = true;
    // The CLI exits right after `create`, so nothing could read a terminal.
    process.detach = match action {
        Action::Create => true,
        Action::Run { detach } => detach,
    };

    let launched = container.create(process).and_then(|()| match action {
        Action::Create => Ok(()),
        Action::Run { .. } => container.start(),
    });
    if let Err(e) = launched {
        discard(&container);
        return Err(e).with_context(|| format!("launch container {id}"));
    }

    match action {
        Action::Run { detach: false } => wait_foreground(&container),
        Action::Create | Action::Run { detach: true } => Ok(None),
    }
}

/// Waits for a foreground container. The first Ctrl+C is forwarded as
/// `SIGTERM`, the second as `SIGKILL`.
fn wait_foreground(container: &Container) -> anyhow::Result<Option<i32>> {
    if let Some(pid) = container.init_pid()? {
        let interrupted = Arc::new(AtomicBool::new(false));
        ctrlc::set_handler(move || {
            let signal = if interrupted.swap(true, Ordering::SeqCst) {
                Signal::SIGKILL
            } else {
                Signal::SIGTERM
            };
            if let Err(e) = send_signal(pid, signal) {
                tracing::warn!(pid, error = %e, "failed to forward interrupt");
            }
        })
        .context("failed to set Ctrl+C handler")?;
    }
    Ok(container.wait()?)
}

fn discard(container: &Container) {
    if let Err(e) = container.destroy() {
        tracing::warn!(id = %container.id(), error = %e, "failed to remove container after launch failure");
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use clap::Parser;

    use super::*;
    use crate::commands::{Cli, Command};

    #[test]
    fn create_accepts_bundle_network_and_ports() {
        let cli = Cli::try_parse_from([
            "capsule", "create", "web", "-b", "/srv/web", "--network", "br0", "-p", "8080:80",
        ])
        .unwrap();
        let Command::Create(args) = cli.command else {
            unreachable!("expected create");
        };
        assert_eq!(args.id, "web");
        assert_eq!(args.launch.bundle.as_deref(), Some(Path::new("/srv/web")));
        assert_eq!(args.launch.network.as_deref(), Some("br0"));
        assert_eq!(args.launch.ports, vec!["8080:80"]);
    }

    #[test]
    fn ports_without_network_are_rejected() {
        let err = Cli::try_parse_from(["capsule", "create", "web", "-p", "8080:80"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn bundle_configs_attach_network() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("rootfs")).unwrap();
        let _ = Spec::example().write(dir.path()).unwrap();
        let args = LaunchArgs {
            bundle: Some(dir.path().to_path_buf()),
            network: Some("br0".into()),
            ports: vec!["8080:80".into()],
        };
        let (config, process) = args.configs().unwrap();
        assert_eq!(config.rootfs, dir.path().join("rootfs"));
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].network, "br0");
        assert_eq!(config.endpoints[0].port_mappings, vec!["8080:80"]);
        assert_eq!(process.args, vec!["sh"]);
    }
}
