//! `capsule init`: Container-side initialization.
//!
//! Reached only through the re-exec performed by a launch; the sync
//! channel and initializer mode come from the environment.

use std::process::ExitCode;

use capsule_runtime::factory::Factory;

/// Sets up the container and execs the user command. Only returns on
/// failure, which the parent has already been told about.
pub fn execute() -> ExitCode {
    match Factory::start_initialization() {
        Ok(never) => match never {},
        Err(e) => {
            eprintln!("capsule init: {e}");
            ExitCode::FAILURE
        }
    }
}
