//! `capsule logs`: Print the log of a detached process.

use capsule_runtime::logs;
use clap::Args;

use super::Context;

/// Arguments for the `logs` command.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Container id.
    pub id: String,

    /// Show the log of this exec process instead of the init process.
    #[arg(long)]
    pub exec: Option<String>,

    /// List the ids of exec processes that left a log.
    #[arg(long, conflicts_with = "exec")]
    pub list_execs: bool,
}

/// Executes the `logs` command.
///
/// # Errors
///
/// Returns an error if the container is not found or the log cannot be
/// read.
pub fn execute(args: &LogsArgs, ctx: &Context) -> anyhow::Result<()> {
    let container = ctx.container(&args.id)?;
    if args.list_execs {
        for id in logs::exec_log_ids(container.root())? {
            println!("{id}");
        }
        return Ok(());
    }
    let path = match &args.exec {
        Some(exec_id) => logs::exec_log_path(container.root(), exec_id),
        None => logs::init_log_path(container.root()),
    };
    print!("{}", logs::read_logs(&path)?);
    Ok(())
}
