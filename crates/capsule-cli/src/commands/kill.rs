//! `capsule kill`: Send a signal to a container's init process.

use std::str::FromStr;

use clap::Args;
use nix::sys::signal::Signal;

use super::Context;

/// Arguments for the `kill` command.
#[derive(Args, Debug)]
pub struct KillArgs {
    /// Container id.
    pub id: String,

    /// Signal name (`TERM`, `SIGKILL`) or number.
    #[arg(default_value = "SIGTERM", value_parser = parse_signal)]
    pub signal: Signal,
}

/// Parses a signal given by number, or by name with or without the `SIG`
/// prefix.
///
/// # Errors
///
/// Returns a message naming the unknown signal.
pub fn parse_signal(raw: &str) -> Result<Signal, String> {
    if let Ok(number) = raw.parse::<i32>() {
        return Signal::try_from(number).map_err(|_| format!("unknown signal {raw:?}"));
    }
    let upper = raw.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name).map_err(|_| format!("unknown signal {raw:?}"))
}

/// Executes the `kill` command.
///
/// # Errors
///
/// Returns an error if the container has no live init process or the
/// signal cannot be delivered.
pub fn execute(args: &KillArgs, ctx: &Context) -> anyhow::Result<()> {
    ctx.container(&args.id)?.signal(args.signal)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_parse_by_name_or_number() {
        assert_eq!(parse_signal("9"), Ok(Signal::SIGKILL));
        assert_eq!(parse_signal("term"), Ok(Signal::SIGTERM));
        assert_eq!(parse_signal("SIGUSR1"), Ok(Signal::SIGUSR1));
        assert!(parse_signal("SIGNOPE").is_err());
        assert!(parse_signal("999").is_err());
    }
}
