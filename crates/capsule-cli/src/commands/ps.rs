//! `capsule ps`: Show the processes of a container.

use clap::Args;

use super::Context;
use crate::output::Table;

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Container id.
    pub id: String,
}

fn command_line(pid: i32) -> String {
    std::fs::read(format!("/proc/{pid}/cmdline"))
        .map(|raw| {
            raw.split(|b| *b == 0)
                .filter(|arg| !arg.is_empty())
                .map(String::from_utf8_lossy)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

/// Executes the `ps` command.
///
/// Lists every process in the container's cgroups.
///
/// # Errors
///
/// Returns an error if the container cannot be loaded or its cgroups
/// cannot be read.
pub fn execute(args: &PsArgs, ctx: &Context) -> anyhow::Result<()> {
    let pids = ctx.container(&args.id)?.processes()?;
    let mut table = Table::new(&["PID", "CMD"]);
    for pid in pids {
        table.row(vec![pid.to_string(), command_line(pid)]);
    }
    table.print();
    Ok(())
}
