//! `capsule image`: Manage images and run containers from them.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use capsule_common::constants::DEFAULT_PATH;
use capsule_image::store::{BindMount, ImageStore};
use capsule_runtime::bundle::{Cpu, Memory, Resources, Root, Spec, SpecMount, endpoint_config};
use capsule_runtime::factory::Factory;
use chrono::SecondsFormat;
use clap::{Args, Subcommand};

use super::Context;
use super::create::{Action, launch};
use crate::output::{Table, format_bytes};

/// Label naming the image a container's rootfs was prepared from.
pub const IMAGE_LABEL: &str = "capsule.image";

/// Arguments for the `image` command.
#[derive(Args, Debug)]
pub struct ImageArgs {
    /// Image operation.
    #[command(subcommand)]
    pub command: ImageCommand,
}

/// Image operations.
#[derive(Subcommand, Debug)]
pub enum ImageCommand {
    /// Create an image from a rootfs tarball (plain or gzip).
    Create {
        /// Image id.
        id: String,
        /// Path of the tarball.
        tar: PathBuf,
    },
    /// Delete an image.
    Delete {
        /// Image id.
        id: String,
    },
    /// List images.
    List,
    /// Print one image as JSON.
    Get {
        /// Image id.
        id: String,
    },
    /// Run a container on a writable overlay of an image.
    Run(ImageRunArgs),
}

/// Arguments for `image run`.
#[derive(Args, Debug)]
pub struct ImageRunArgs {
    /// Image id.
    pub image: String,

    /// Container id.
    #[arg(long)]
    pub id: String,

    /// Return once started; output goes to the container log.
    #[arg(short, long)]
    pub detach: bool,

    /// Working directory inside the container.
    #[arg(long, default_value = "/")]
    pub cwd: PathBuf,

    /// Environment entry `KEY=value`; may be repeated.
    #[arg(short, long = "env")]
    pub env: Vec<String>,

    /// Hostname; defaults to the container id.
    #[arg(long)]
    pub hostname: Option<String>,

    /// Relative CPU weight.
    #[arg(long, default_value_t = 1024)]
    pub cpushare: u64,

    /// Memory limit in bytes; 0 for none.
    #[arg(long, default_value_t = 0)]
    pub memory: i64,

    /// Network to connect the container to.
    #[arg(long, alias = "net")]
    pub network: Option<String>,

    /// Port mapping `hostPort:containerPort`; needs `--network`.
    #[arg(short, long = "port", requires = "network")]
    pub ports: Vec<String>,

    /// Label `key=value`; may be repeated.
    #[arg(short, long = "label", value_parser = parse_label)]
    pub labels: Vec<(String, String)>,

    /// Volume `hostDir:containerDir`, or a bare container path for an
    /// anonymous volume; may be repeated.
    #[arg(short, long = "volume")]
    pub volumes: Vec<String>,

    /// Link `container:alias`, added to /etc/hosts; may be repeated.
    #[arg(long = "link")]
    pub links: Vec<String>,

    /// Command and arguments.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .ok_or_else(|| format!("label must be key=value: {raw:?}"))
}

/// Executes the `image` command.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or the operation fails.
pub fn execute(args: ImageArgs, ctx: &Context) -> anyhow::Result<Option<i32>> {
    let store = ImageStore::open(ctx.runtime.images_dir())?;
    match args.command {
        ImageCommand::Create { id, tar } => {
            let info = store.create(&id, &tar)?;
            tracing::info!(id = %info.id, layer = %info.layer, "image created");
        }
        ImageCommand::Delete { id } => store.delete(&id)?,
        ImageCommand::List => {
            let mut table = Table::new(&["ID", "LAYER", "CREATED", "SIZE"]);
            for image in store.list()? {
                table.row(vec![
                    image.id,
                    image.layer.chars().take(12).collect(),
                    image.created.to_rfc3339_opts(SecondsFormat::Secs, true),
                    format_bytes(image.size_bytes),
                ]);
            }
            table.print();
        }
        ImageCommand::Get { id } => {
            println!("{}", serde_json::to_string_pretty(&store.get(&id)?)?);
        }
        ImageCommand::Run(run) => return run_container(&run, &store, ctx),
    }
    Ok(None)
}

/// Prepares an overlay rootfs and a generated bundle, then runs the
/// container. The rootfs is cleaned up when the launch fails, and together
/// with the container once a foreground run ends.
fn run_container(
    args: &ImageRunArgs,
    store: &ImageStore,
    ctx: &Context,
) -> anyhow::Result<Option<i32>> {
    let factory = ctx.factory()?;
    if factory.exists(&args.id) {
        anyhow::bail!("container already exists: {}", args.id);
    }

    let prepared = prepare_bundle(args, store, &factory);
    let result = prepared.and_then(|bundle| {
        let (mut config, process) = Spec::load(&bundle)?.to_configs(&bundle)?;
        if let Some(network) = &args.network {
            config.endpoints = vec![endpoint_config(network, args.ports.clone())];
        }
        launch(ctx, &args.id, config, process, Action::Run { detach: args.detach })
    });

    if result.is_err() || !args.detach {
        if result.is_ok() {
            if let Err(e) = factory.load(&args.id).and_then(|c| c.destroy()) {
                tracing::warn!(id = %args.id, error = %e, "failed to remove exited container");
            }
        }
        if let Err(e) = store.cleanup(&args.id) {
            tracing::warn!(id = %args.id, error = %e, "failed to clean up image rootfs");
        }
    }
    result
}

fn prepare_bundle(
    args: &ImageRunArgs,
    store: &ImageStore,
    factory: &Factory,
) -> anyhow::Result<PathBuf> {
    let links = args
        .links
        .iter()
        .map(|link| resolve_link(factory, link))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let mut binds = store.prepare_etc(&args.id, &links)?;
    for volume in &args.volumes {
        binds.push(store.prepare_volume(volume)?);
    }
    let rootfs = store
        .prepare_rootfs(&args.id, &args.image)
        .with_context(|| format!("prepare rootfs from image {}", args.image))?;

    let bundle = store.container_dir(&args.id);
    let _ = image_spec(args, &rootfs, &binds).write(&bundle)?;
    Ok(bundle)
}

fn resolve_link(factory: &Factory, link: &str) -> anyhow::Result<(Ipv4Addr, String)> {
    let (container, alias) = link
        .split_once(':')
        .with_context(|| format!("link must be container:alias: {link:?}"))?;
    let state = factory.load(container)?.state()?;
    let ip = state
        .endpoints
        .first()
        .map(|ep| ep.ip)
        .with_context(|| format!("linked container {container} has no network"))?;
    Ok((ip, alias.to_owned()))
}

/// Bundle configuration for a container rooted at an image overlay.
fn image_spec(args: &ImageRunArgs, rootfs: &Path, binds: &[BindMount]) -> Spec {
    let mut spec = Spec::example();
    spec.root = Some(Root {
        path: rootfs.to_path_buf(),
        readonly: false,
    });
    if let Some(process) = spec.process.as_mut() {
        process.args.clone_from(&args.command);
        process.env = args.env.clone();
        process.env.push(format!("PATH={DEFAULT_PATH}"));
        process.env.push("TERM=xterm".to_owned());
        process.cwd.clone_from(&args.cwd);
    }
    spec.hostname = args.hostname.clone().unwrap_or_else(|| args.id.clone());
    spec.mounts.extend(binds.iter().map(|bind| SpecMount {
        destination: bind.destination.clone(),
        kind: "bind".to_owned(),
        source: bind.source.display().to_string(),
        options: vec!["rbind".to_owned()],
    }));
    if let Some(linux) = spec.linux.as_mut() {
        linux.resources = Some(Resources {
            memory: Some(Memory {
                limit: (args.memory > 0).then_some(args.memory),
            }),
            cpu: Some(Cpu {
                shares: Some(args.cpushare),
                cpus: None,
            }),
        });
    }
    let mut annotations: BTreeMap<String, String> = args.labels.iter().cloned().collect();
    let _ = annotations.insert(IMAGE_LABEL.to_owned(), args.image.clone());
    spec.annotations = annotations;
    spec
}
