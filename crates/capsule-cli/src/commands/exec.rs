//! `capsule exec`: Execute a command inside a running container.

use std::path::PathBuf;

use capsule_common::config::ProcessConfig;
use capsule_common::constants::DEFAULT_PATH;
use clap::Args;

use super::Context;

/// Arguments for the `exec` command.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Container id.
    pub id: String,

    /// Return once started; output goes to the exec log.
    #[arg(short, long)]
    pub detach: bool,

    /// Environment entry `KEY=value`; may be repeated.
    #[arg(short, long = "env")]
    pub env: Vec<String>,

    /// Working directory inside the container.
    #[arg(long, default_value = "/")]
    pub cwd: PathBuf,

    /// `uid[:gid]` to run as.
    #[arg(short, long, default_value = "")]
    pub user: String,

    /// Exec id naming the log of a detached process; generated if empty.
    #[arg(long = "exec-id", default_value = "")]
    pub exec_id: String,

    /// Command to execute.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

impl ExecArgs {
    /// Process description for the exec. `PATH` defaults to the standard
    /// search path.
    #[must_use]
    pub fn process(&self) -> ProcessConfig {
        let mut env = self.env.clone();
        if !env.iter().any(|e| e.starts_with("PATH=")) {
            env.push(format!("PATH={DEFAULT_PATH}"));
        }
        ProcessConfig {
            id: self.exec_id.clone(),
            args: self.command.clone(),
            env,
            cwd: self.cwd.clone(),
            user: self.user.clone(),
            detach: self.detach,
            ..ProcessConfig::default()
        }
    }
}

/// Executes the `exec` command.
///
/// A foreground exec returns the process's exit code; a detached one
/// prints its exec id.
///
/// # Errors
///
/// Returns an error if the container is not running or the launch fails.
pub fn execute(args: ExecArgs, ctx: &Context) -> anyhow::Result<Option<i32>> {
    let container = ctx.container(&args.id)?;
    let mut process = args.process();
    if args.detach && process.id.is_empty() {
        process.id = capsule_common::types::ContainerId::generate().to_string();
    }
    let exec_id = process.id.clone();
    let code = container.exec(process)?;
    if args.detach {
        println!("{exec_id}");
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::commands::{Cli, Command};

    #[test]
    fn trailing_command_keeps_its_flags() {
        let cli = Cli::try_parse_from([
            "capsule", "exec", "web", "-e", "A=1", "--", "ls", "-la", "/",
        ])
        .unwrap();
        let Command::Exec(args) = cli.command else {
            unreachable!("expected exec");
        };
        let process = args.process();
        assert_eq!(process.args, vec!["ls", "-la", "/"]);
        assert_eq!(process.env, vec!["A=1".to_owned(), format!("PATH={DEFAULT_PATH}")]);
        assert_eq!(process.cwd, PathBuf::from("/"));
        assert!(!process.init);
    }
}
