//! `capsule bundle`: Write an example config.json.

use std::path::PathBuf;

use capsule_runtime::bundle::Spec;
use clap::Args;

/// Arguments for the `bundle` command.
#[derive(Args, Debug)]
pub struct BundleArgs {
    /// Bundle directory to write config.json into.
    #[arg(short, long, default_value = ".")]
    pub bundle: PathBuf,
}

/// Executes the `bundle` command. An existing config.json is left alone.
///
/// # Errors
///
/// Returns an error if config.json exists or cannot be written.
pub fn execute(args: &BundleArgs) -> anyhow::Result<()> {
    let path = Spec::example().write(&args.bundle)?;
    tracing::info!(path = %path.display(), "example bundle written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_once_and_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let args = BundleArgs {
            bundle: dir.path().to_path_buf(),
        };
        execute(&args).unwrap();
        assert!(dir.path().join("config.json").exists());
        assert!(execute(&args).is_err());
    }
}
