//! `capsule list`: List containers.

use chrono::SecondsFormat;
use clap::Args;

use super::Context;
use super::state::ContainerView;
use crate::output::Table;

/// Arguments for the `list` command.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Print only container ids.
    #[arg(short, long)]
    pub quiet: bool,
}

/// Executes the `list` command.
///
/// Containers whose state cannot be read are skipped with a warning.
///
/// # Errors
///
/// Returns an error if the runtime root cannot be listed.
pub fn execute(args: &ListArgs, ctx: &Context) -> anyhow::Result<()> {
    let factory = ctx.factory()?;
    let ids = factory.ids()?;
    if args.quiet {
        for id in ids {
            println!("{id}");
        }
        return Ok(());
    }

    let mut table = Table::new(&["ID", "PID", "STATUS", "IP", "BUNDLE", "CREATED"]);
    for id in ids {
        let loaded = factory.load(&id).map_err(anyhow::Error::from);
        let view = match loaded.and_then(|c| ContainerView::of(&c)) {
            Ok(view) => view,
            Err(e) => {
                tracing::warn!(id, error = %e, "skipping unreadable container");
                continue;
            }
        };
        table.row(vec![
            view.id,
            view.pid.to_string(),
            view.status,
            view.ip.unwrap_or_default(),
            view.bundle,
            view.created.to_rfc3339_opts(SecondsFormat::Secs, true),
        ]);
    }
    table.print();
    Ok(())
}
