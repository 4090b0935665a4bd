use anyhow::{Context, Result};
use std::path::PathBuf;

use family_guard::config::{EXAMPLE_CONFIG, get_config_path, load_config_or_default};
use family_guard::platform::common::atomic_write;

use super::utils::open_engine;

/// Write an example configuration file and set the first admin password
pub fn init(
    config_path: Option<PathBuf>,
    state_path: Option<PathBuf>,
    admin_password: Option<String>,
    force: bool,
) -> Result<()> {
    let output_path = match config_path {
        Some(path) => path,
        None => get_config_path()?,
    };

    if output_path.exists() && !force {
        println!(
            "Configuration file already exists: {} (use --force to overwrite)",
            output_path.display()
        );
    } else {
        atomic_write(&output_path, EXAMPLE_CONFIG.as_bytes()).with_context(|| {
            format!("Failed to write config file: {}", output_path.display())
        })?;
        println!("✓ Created configuration file: {}", output_path.display());
    }

    let mut config = load_config_or_default(&output_path)?;
    if state_path.is_some() {
        config.state_path = state_path;
    }

    let (_runtime, engine) = open_engine(&config)?;
    match admin_password {
        Some(password) => {
            if engine.store().has_admin_credential() {
                anyhow::bail!(
                    "An admin password is already set. Use `family-guard admin set-password` to change it."
                );
            }
            engine
                .set_admin_credential("", &password)
                .context("Failed to set the admin password")?;
            println!("✓ Admin password set");
        }
        None if !engine.store().has_admin_credential() => {
            println!("\nNo admin password is set yet. Run:");
            println!("  family-guard init --admin-password <PASSWORD>");
        }
        None => {}
    }

    println!("\nNext steps:");
    println!("  family-guard profile add <NAME> --age <AGE> --limit <MINUTES> --password <PW> --admin-password <ADMIN>");
    println!("  sudo family-guard run --block-sites --block-apps");

    Ok(())
}
