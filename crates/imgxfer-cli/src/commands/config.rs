//! Config command implementation.

use anyhow::{bail, Context, Result};

use imgxfer_core::config::Config;

use super::{ConfigAction, ConfigArgs};

/// Run the config command.
pub fn run(args: ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Show => show(),
        ConfigAction::Path => {
            println!("{}", Config::config_path().display());
            Ok(())
        }
        ConfigAction::Init { force } => init(force),
    }
}

fn show() -> Result<()> {
    let config = super::load_config()?;
    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}

fn init(force: bool) -> Result<()> {
    let path = Config::config_path();
    if path.exists() && !force {
        bail!(
            "Configuration already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    Config::default()
        .save()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("✓ Wrote default configuration to: {}", path.display());
    Ok(())
}
