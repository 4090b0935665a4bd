use anyhow::{Context, Result};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use family_guard::config::EngineConfig;
use family_guard::engine::{Engine, system_engine};
use family_guard::error::EngineError;
use family_guard::platform::common::ensure_admin_privileges;
use family_guard::time_limits::UnlockOutcome;

use super::status::print_engine_status;
use super::utils::{build_runtime, format_remaining, print_sudo_message};

/// How often the running engine saves its state regardless of changes
const CHECKPOINT_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// Run the enforcement engine in the foreground until Ctrl+C or `quit`
pub fn run(
    config: EngineConfig,
    profile: Option<String>,
    block_sites: bool,
    block_apps: bool,
) -> Result<()> {
    if let Err(e) = ensure_admin_privileges() {
        eprintln!("Insufficient privileges: {:#}", e);
        print_sudo_message();
        std::process::exit(1);
    }

    println!("Family Guard v{}", env!("CARGO_PKG_VERSION"));
    println!("Press Ctrl+C or type `quit` to stop");
    println!();

    let runtime = build_runtime()?;
    runtime.block_on(run_engine(config, profile, block_sites, block_apps))
}

async fn run_engine(
    config: EngineConfig,
    profile: Option<String>,
    block_sites: bool,
    block_apps: bool,
) -> Result<()> {
    let engine = Arc::new(system_engine(&config, Handle::current())?);

    engine.start_monitoring();
    if block_apps {
        engine.start_app_blocking();
    }
    if block_sites || engine.status().kill_switch {
        if let Err(e) = engine.start_blocking() {
            warn!("Site blocking is unavailable: {}", e);
        }
    }

    if let Some(profile) = &profile {
        match engine.start_session(profile) {
            Ok(granted) => println!("Session for {} started: {} left", profile, format_remaining(granted)),
            Err(e) => {
                engine.shutdown().await?;
                return Err(e).with_context(|| format!("Failed to start a session for {}", profile));
            }
        }
    }

    let mut lines = spawn_console_reader();
    let mut console_open = true;
    let mut checkpoint = tokio::time::interval(CHECKPOINT_PERIOD);
    checkpoint.tick().await;
    let mut lock_watch = tokio::time::interval(Duration::from_secs(1));
    let mut was_locked = engine.is_locked();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    print_help();

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Received Ctrl+C");
                break;
            }
            _ = checkpoint.tick() => {
                if let Err(e) = engine.checkpoint() {
                    warn!("Periodic state save failed: {}", e);
                }
            }
            _ = lock_watch.tick() => {
                let locked = engine.is_locked();
                if locked && !was_locked {
                    println!("Screen locked. Enter the password to unlock.");
                }
                was_locked = locked;
            }
            line = lines.recv(), if console_open => match line {
                Some(line) => {
                    if handle_line(&engine, line.trim()).await == Flow::Quit {
                        break;
                    }
                    was_locked = engine.is_locked();
                }
                None => {
                    debug!("Console input closed; running until Ctrl+C");
                    console_open = false;
                }
            },
        }
    }

    engine.shutdown().await.context("Failed to save state on shutdown")?;
    println!("Stopped.");
    Ok(())
}

/// Read stdin lines on a plain thread; the receiver closes at end of input.
fn spawn_console_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();

    let spawned = std::thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to read console input: {}", e);
                        break;
                    }
                }
            }
        });

    if let Err(e) = spawned {
        warn!("Failed to spawn console thread: {}", e);
    }
    rx
}

fn print_help() {
    println!("Commands: status, remaining [PROFILE], start PROFILE, stop, lock, quit");
}

async fn handle_line(engine: &Arc<Engine>, line: &str) -> Flow {
    // While locked every line is a password attempt.
    if engine.is_locked() {
        let engine = engine.clone();
        let attempt = line.to_string();
        match tokio::task::spawn_blocking(move || engine.unlock(&attempt)).await {
            Ok(Ok(UnlockOutcome::Unlocked)) => println!("✓ Unlocked"),
            Ok(Ok(UnlockOutcome::NotLocked)) => {}
            Ok(Err(EngineError::CredentialMismatch)) => println!("Wrong password. The screen stays locked."),
            Ok(Err(e)) => println!("Unlock failed: {}", e),
            Err(e) => warn!("Unlock task failed: {}", e),
        }
        return Flow::Continue;
    }

    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or_default();
    let argument = words.next();

    match (command, argument) {
        ("", _) => {}
        ("status", _) => print_engine_status(&engine.status()),
        ("remaining", name) => {
            let name = name
                .map(str::to_string)
                .or_else(|| engine.session().profile);
            match name {
                Some(name) => match engine.query_remaining_time(&name) {
                    Ok(seconds) => println!("{}: {} left today", name, format_remaining(seconds)),
                    Err(e) => println!("{}", e),
                },
                None => println!("No session is running; give a profile name"),
            }
        }
        ("start", Some(name)) => match engine.start_session(name) {
            Ok(granted) => println!("Session for {} started: {} left", name, format_remaining(granted)),
            Err(e) => println!("{}", e),
        },
        ("stop", _) => {
            if engine.stop_session().await {
                println!("Session stopped");
            } else {
                println!("No session is running");
            }
        }
        ("lock", _) => {
            engine.lock_now();
        }
        ("quit" | "exit", _) => return Flow::Quit,
        _ => print_help(),
    }

    if engine.is_locked() {
        println!("Screen is locked. Enter the password to unlock.");
    }
    Flow::Continue
}
