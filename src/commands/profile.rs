use anyhow::{Context, Result};
use chrono::Utc;

use family_guard::config::EngineConfig;
use family_guard::policy::{Credential, LogEntry, Profile};

use super::utils::{format_duration, format_remaining, open_engine};
use crate::cli::{AdminCommands, ProfileCommands};

/// Child profile commands
pub fn profile(config: &EngineConfig, command: ProfileCommands) -> Result<()> {
    let (_runtime, engine) = open_engine(config)?;

    match command {
        ProfileCommands::Add {
            name,
            age,
            limit,
            password,
            admin_password,
        } => {
            let profile = Profile::new(&name, age, Credential::new(password), limit);
            engine
                .create_profile(&admin_password, profile)
                .with_context(|| format!("Failed to create profile '{}'", name))?;

            println!("✓ Added profile: {} (age {})", name, age);
            println!("  Daily limit: {} minutes", limit);
            println!("\nStart a session with: family-guard run --profile {}", name);
        }
        ProfileCommands::Remove { name, password } => {
            let removed = engine
                .delete_profile(&name, &password)
                .with_context(|| format!("Failed to delete profile '{}'", name))?;
            println!(
                "✓ Deleted profile: {} ({} log entries discarded)",
                removed.name,
                removed.activity_log.len()
            );
        }
        ProfileCommands::List => {
            let profiles = engine.store().profiles();
            if profiles.is_empty() {
                println!("No profiles. Add one with: family-guard profile add");
                return Ok(());
            }

            for profile in profiles {
                let remaining = engine.query_remaining_time(&profile.name)?;
                println!("{} (age {})", profile.name, profile.age);
                println!(
                    "  Used today:  {} of {} minutes ({} left)",
                    profile.used_minutes,
                    profile.daily_limit_minutes,
                    format_remaining(remaining)
                );
                println!(
                    "  Blocked:     {} sites, {} applications",
                    profile.blocked_sites.len(),
                    profile.blocked_apps.len()
                );
            }
        }
        ProfileCommands::Reset {
            name,
            admin_password,
        } => {
            engine
                .reset_usage(&admin_password, &name)
                .with_context(|| format!("Failed to reset usage for '{}'", name))?;
            println!("✓ Usage reset for {}", name);
        }
        ProfileCommands::Log { name, limit } => {
            let entries = match &name {
                Some(name) => {
                    engine
                        .store()
                        .profile(name)
                        .with_context(|| format!("Profile '{}' not found", name))?
                        .activity_log
                }
                None => engine.store().machine_log(),
            };
            print_log(&entries, limit);
        }
    }

    Ok(())
}

fn print_log(entries: &[LogEntry], limit: usize) {
    if entries.is_empty() {
        println!("No activity recorded");
        return;
    }

    let skip = entries.len().saturating_sub(limit);
    let now = Utc::now();
    for entry in &entries[skip..] {
        println!(
            "{}  {:<15} {}  ({} ago)",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.kind.to_string(),
            entry.subject,
            format_duration(now - entry.timestamp)
        );
    }
}

/// Administrator commands
pub fn admin(config: &EngineConfig, command: AdminCommands) -> Result<()> {
    let (_runtime, engine) = open_engine(config)?;

    match command {
        AdminCommands::SetPassword { current, new } => {
            engine
                .set_admin_credential(current.as_deref().unwrap_or_default(), &new)
                .context("Failed to change the admin password")?;
            println!("✓ Admin password updated");
        }
    }

    Ok(())
}
