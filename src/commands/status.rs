use anyhow::Result;
use chrono::Utc;

use family_guard::config::EngineConfig;
use family_guard::engine::{Engine, EngineStatus};
use family_guard::enforcement::FilterState;
use family_guard::time_limits::{GateState, TimerPhase};

use super::utils::{format_duration, format_remaining, open_engine};

/// Show stored policy and today's usage
pub fn show(config: &EngineConfig) -> Result<()> {
    let (_runtime, engine) = open_engine(config)?;
    print_policy(&engine)?;
    Ok(())
}

pub fn print_policy(engine: &Engine) -> Result<()> {
    let content = engine.store().content();

    println!("Family Guard Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!(
        "Internet:         {}",
        if content.internet_disabled { "DISABLED" } else { "allowed" }
    );
    println!("Blocked sites:    {}", content.blocked_sites.len());
    println!("Blocked apps:     {}", content.blocked_apps.len());
    println!(
        "Admin password:   {}",
        if content.admin_credential.is_empty() { "not set" } else { "set" }
    );
    println!("Usage date:       {}", content.usage_date);

    println!();
    if content.profiles.is_empty() {
        println!("No profiles configured");
    }
    for profile in &content.profiles {
        let remaining = engine.query_remaining_time(&profile.name)?;
        println!(
            "  {:<12} {:>4} / {:<4} min used, {} left",
            profile.name,
            profile.used_minutes,
            profile.daily_limit_minutes,
            format_remaining(remaining)
        );
    }

    Ok(())
}

/// One-screen summary of a running engine
pub fn print_engine_status(status: &EngineStatus) {
    let on_off = |on: bool| if on { "on" } else { "off" };

    println!(
        "Site blocking:    {}{}",
        match status.filter {
            FilterState::Filtering => "on",
            FilterState::Idle => "off",
        },
        if status.kill_switch { " (internet disabled)" } else { "" }
    );
    println!("App blocking:     {}", on_off(status.app_blocking));
    println!("Activity log:     {}", on_off(status.monitoring));
    println!(
        "Policy:           {} sites, {} apps (generation {})",
        status.blocked_sites, status.blocked_apps, status.generation
    );

    match (&status.session.profile, status.session.phase) {
        (Some(profile), TimerPhase::Running) => println!(
            "Session:          {} ({} left)",
            profile,
            format_remaining(status.session.remaining_seconds)
        ),
        (Some(profile), TimerPhase::Expired) => println!("Session:          {} (time is up)", profile),
        _ => println!("Session:          none"),
    }

    if status.gate == GateState::Locked {
        let since = status
            .locked_at
            .map(|at| format!(", {} ago", format_duration(Utc::now() - at)))
            .unwrap_or_default();
        let reason = status
            .lock_reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "locked".to_string());
        println!("Screen:           LOCKED ({}{})", reason, since);
    } else {
        println!("Screen:           open");
    }
}
