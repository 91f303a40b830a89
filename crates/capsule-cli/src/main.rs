//! # capsule
//!
//! Daemon-less OCI-style container runtime.
//! The same binary is re-executed as `capsule init` to become each
//! container process.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod commands;
mod output;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::commands::{Cli, LogFormat};

fn main() -> ExitCode {
    // Must run while the process is still single-threaded.
    capsule_core::nsenter::nsexec();

    if std::env::args().nth(1).as_deref() == Some(capsule_common::constants::CONTAINER_INIT_ARG) {
        return commands::init::execute();
    }

    let cli = Cli::parse();
    init_tracing(cli.debug, cli.log_format);
    match commands::execute(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("capsule: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(debug: bool, format: LogFormat) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
