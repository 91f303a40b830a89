//! CLI command definitions and dispatch.

pub mod bundle;
pub mod clean;
pub mod create;
pub mod delete;
pub mod exec;
pub mod image;
pub mod init;
pub mod kill;
pub mod list;
pub mod logs;
pub mod network;
pub mod pause;
pub mod ps;
pub mod run;
pub mod start;
pub mod state;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use capsule_common::config::RuntimeConfig;
use capsule_common::constants::{DEFAULT_RUNTIME_ROOT, RUNTIME_ROOT_ENV};
use capsule_runtime::container::Container;
use capsule_runtime::factory::Factory;
use clap::{Parser, Subcommand, ValueEnum};

/// capsule: daemon-less OCI-style container runtime.
#[derive(Parser, Debug)]
#[command(name = "capsule", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Runtime root holding container, image, and network state.
    #[arg(long, global = true, env = RUNTIME_ROOT_ENV, default_value = DEFAULT_RUNTIME_ROOT)]
    pub root: PathBuf,

    /// Enable debug logging.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Log line format on stderr.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a container from a bundle, blocked before its command.
    Create(create::CreateArgs),
    /// Create and start a container.
    Run(run::RunArgs),
    /// Release a created container into its command.
    Start(start::StartArgs),
    /// Delete a container.
    Delete(delete::DeleteArgs),
    /// Send a signal to a container's init process.
    Kill(kill::KillArgs),
    /// List containers.
    List(list::ListArgs),
    /// Print a container's state as JSON.
    State(state::StateArgs),
    /// Execute a command inside a running container.
    Exec(exec::ExecArgs),
    /// Show the processes of a container.
    Ps(ps::PsArgs),
    /// Freeze every process of a container.
    Pause(pause::PauseArgs),
    /// Thaw a paused container.
    Resume(pause::PauseArgs),
    /// Print the log of a detached container or exec process.
    Logs(logs::LogsArgs),
    /// Write an example config.json.
    Bundle(bundle::BundleArgs),
    /// Container-side initialization (internal).
    #[command(hide = true)]
    Init,
    /// Manage networks.
    Network(network::NetworkArgs),
    /// Manage images and run containers from them.
    Image(image::ImageArgs),
    /// Remove every runtime file under the root.
    Clean(clean::CleanArgs),
}

/// Dispatches the parsed CLI command to its handler. The returned code is
/// the exit status of a waited-for container process, or success.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let ctx = Context {
        runtime: RuntimeConfig::with_root(cli.root),
    };
    let code = match cli.command {
        Command::Create(args) => create::execute(args, &ctx).map(|()| None),
        Command::Run(args) => run::execute(args, &ctx),
        Command::Start(args) => start::execute(&args, &ctx).map(|()| None),
        Command::Delete(args) => delete::execute(&args, &ctx).map(|()| None),
        Command::Kill(args) => kill::execute(&args, &ctx).map(|()| None),
        Command::List(args) => list::execute(&args, &ctx).map(|()| None),
        Command::State(args) => state::execute(&args, &ctx).map(|()| None),
        Command::Exec(args) => exec::execute(args, &ctx),
        Command::Ps(args) => ps::execute(&args, &ctx).map(|()| None),
        Command::Pause(args) => pause::pause(&args, &ctx).map(|()| None),
        Command::Resume(args) => pause::resume(&args, &ctx).map(|()| None),
        Command::Logs(args) => logs::execute(&args, &ctx).map(|()| None),
        Command::Bundle(args) => bundle::execute(&args).map(|()| None),
        Command::Init => return Ok(init::execute()),
        Command::Network(args) => network::execute(args, &ctx).map(|()| None),
        Command::Image(args) => image::execute(args, &ctx),
        Command::Clean(args) => clean::execute(&args, &ctx).map(|()| None),
    }?;
    Ok(exit_code(code))
}

/// Maps a container process exit code to the CLI's own exit status.
#[must_use]
pub fn exit_code(code: Option<i32>) -> ExitCode {
    ExitCode::from(status_byte(code))
}

fn status_byte(code: Option<i32>) -> u8 {
    code.map_or(0, |code| u8::try_from(code).unwrap_or(1))
}

/// Settings shared by every command.
#[derive(Debug)]
pub struct Context {
    /// Runtime root and cgroup parent.
    pub runtime: RuntimeConfig,
}

impl Context {
    /// Opens the container factory under the runtime root.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime root cannot be prepared.
    pub fn factory(&self) -> anyhow::Result<Factory> {
        Factory::new(self.runtime.clone()).with_context(|| {
            format!("open runtime root {}", self.runtime.root.display())
        })
    }

    /// Loads an existing container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container does not exist or cannot be
    /// loaded.
    pub fn container(&self, id: &str) -> anyhow::Result<Container> {
        Ok(self.factory()?.load(id)?)
    }
}
