use anyhow::{Context, Result};

use family_guard::config::EngineConfig;
use family_guard::engine::Engine;
use family_guard::policy::Change;

use super::utils::open_engine;
use crate::cli::{Access, ListCommands};

#[derive(Debug, Clone, Copy)]
enum Kind {
    Site,
    App,
}

impl Kind {
    fn noun(self) -> &'static str {
        match self {
            Kind::Site => "site",
            Kind::App => "application",
        }
    }
}

/// Blocked website commands
pub fn site(config: &EngineConfig, command: ListCommands) -> Result<()> {
    run_list_command(config, Kind::Site, command)
}

/// Blocked application commands
pub fn app(config: &EngineConfig, command: ListCommands) -> Result<()> {
    run_list_command(config, Kind::App, command)
}

fn run_list_command(config: &EngineConfig, kind: Kind, command: ListCommands) -> Result<()> {
    let (_runtime, engine) = open_engine(config)?;

    match command {
        ListCommands::Add { name, profile } => {
            let change = match kind {
                Kind::Site => engine.add_site(profile.as_deref(), &name),
                Kind::App => engine.add_app(profile.as_deref(), &name),
            }
            .with_context(|| format!("Failed to block {} {}", kind.noun(), name))?;
            report(kind, &name, profile.as_deref(), change);
        }
        ListCommands::Remove { name, profile } => {
            let change = match kind {
                Kind::Site => engine.remove_site(profile.as_deref(), &name),
                Kind::App => engine.remove_app(profile.as_deref(), &name),
            }
            .with_context(|| format!("Failed to unblock {} {}", kind.noun(), name))?;
            report(kind, &name, profile.as_deref(), change);
        }
        ListCommands::List { profile } => list(&engine, kind, profile.as_deref())?,
    }

    Ok(())
}

fn report(kind: Kind, name: &str, profile: Option<&str>, change: Change) {
    let scope = profile.map(|p| format!(" for {}", p)).unwrap_or_default();
    match change {
        Change::Added => println!("✓ Blocked {} {}{}", kind.noun(), name, scope),
        Change::AlreadyPresent => println!("{} {} is already blocked{}", kind.noun(), name, scope),
        Change::Removed => println!("✓ Unblocked {} {}{}", kind.noun(), name, scope),
        Change::NotFound => println!("{} {} was not blocked{}", kind.noun(), name, scope),
    }
}

fn list(engine: &Engine, kind: Kind, profile: Option<&str>) -> Result<()> {
    let content = engine.store().content();

    let entries = match profile {
        Some(name) => {
            let profile = engine
                .store()
                .profile(name)
                .with_context(|| format!("Profile '{}' not found", name))?;
            match kind {
                Kind::Site => profile.blocked_sites,
                Kind::App => profile.blocked_apps,
            }
        }
        None => match kind {
            Kind::Site => content.blocked_sites,
            Kind::App => content.blocked_apps,
        },
    };

    if entries.is_empty() {
        println!("No blocked {}s", kind.noun());
        return Ok(());
    }

    for entry in &entries {
        println!("  - {}", entry);
    }

    Ok(())
}

/// Internet kill switch
///
/// Only the stored flag changes here; a running engine enforces it.
pub fn internet(config: &EngineConfig, access: Access) -> Result<()> {
    let (_runtime, engine) = open_engine(config)?;

    let disable = access == Access::Off;
    let previous = engine.store().set_kill_switch(disable);
    engine.checkpoint().context("Failed to save state")?;

    match (previous, disable) {
        (false, true) => println!("✓ Internet access disabled"),
        (true, false) => println!("✓ Internet access restored"),
        (_, true) => println!("Internet access is already disabled"),
        (_, false) => println!("Internet access is already allowed"),
    }

    if disable {
        println!("\nAll outbound traffic is dropped while `family-guard run` is active.");
    }

    Ok(())
}
