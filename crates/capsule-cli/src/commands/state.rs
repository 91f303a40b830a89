//! `capsule state`: Print a container's state as JSON.

use std::collections::BTreeMap;
use std::path::PathBuf;

use capsule_runtime::bundle::OCI_VERSION;
use capsule_runtime::container::Container;
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;

use super::Context;

/// Label recording the bundle a container was created from.
const BUNDLE_LABEL: &str = "bundle";

/// Arguments for the `state` command.
#[derive(Args, Debug)]
pub struct StateArgs {
    /// Container id.
    pub id: String,
}

/// Externally visible state of one container.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerView {
    /// OCI runtime-spec version.
    pub oci_version: String,
    /// Container id.
    pub id: String,
    /// Host pid of the init process, 0 when there is none.
    pub pid: i32,
    /// `created`, `running` or `stopped`.
    pub status: String,
    /// Bundle directory the container was created from.
    pub bundle: String,
    /// Host path of the root filesystem.
    pub rootfs: PathBuf,
    /// Address on the first attached network.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// User annotations.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ContainerView {
    /// Collects the view of a loaded container.
    ///
    /// # Errors
    ///
    /// Returns an error if the status or state cannot be read.
    pub fn of(container: &Container) -> anyhow::Result<Self> {
        let status = container.status()?;
        let pid = container.init_pid()?.unwrap_or(0);
        let state = container.state()?;
        let mut annotations = state.config.labels.clone();
        let bundle = annotations.remove(BUNDLE_LABEL).unwrap_or_default();
        Ok(Self {
            oci_version: OCI_VERSION.to_owned(),
            id: state.id,
            pid,
            status: status.to_string(),
            bundle,
            rootfs: state.config.rootfs,
            ip: state.endpoints.first().map(|ep| ep.ip.to_string()),
            created: state.create_time,
            annotations,
        })
    }
}

/// Executes the `state` command.
///
/// # Errors
///
/// Returns an error if the container cannot be loaded.
pub fn execute(args: &StateArgs, ctx: &Context) -> anyhow::Result<()> {
    let view = ContainerView::of(&ctx.container(&args.id)?)?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
