//! Fire-and-forget notifications about sessions and enforcement.

use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    SessionStarted { profile: String, remaining_minutes: u32 },
    TimeExpired { profile: String },
    AppTerminated { name: String, pid: u32 },
}

impl Notification {
    pub fn title(&self) -> &'static str {
        match self {
            Notification::SessionStarted { .. } => "Session Started",
            Notification::TimeExpired { .. } => "Time's Up",
            Notification::AppTerminated { .. } => "Application Blocked",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Notification::SessionStarted {
                profile,
                remaining_minutes,
            } => format!(
                "{} started a session with {} minutes remaining today.",
                profile, remaining_minutes
            ),
            Notification::TimeExpired { profile } => format!(
                "{}, your computer time has run out. The screen is locked.",
                profile
            ),
            Notification::AppTerminated { name, pid } => {
                format!("{} (pid {}) is blocked and was closed.", name, pid)
            }
        }
    }
}

/// Delivers notifications. Must never block the caller for long or fail loudly.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        info!("{}: {}", notification.title(), notification.message());
    }
}

/// Shows a desktop notification on a detached thread, and logs it.
#[derive(Debug, Default, Clone, Copy)]
pub struct DesktopNotifier;

impl Notifier for DesktopNotifier {
    fn notify(&self, notification: Notification) {
        info!("{}: {}", notification.title(), notification.message());

        let spawned = std::thread::Builder::new()
            .name("notify".into())
            .spawn(move || {
                if let Err(e) =
                    send_system_notification(notification.title(), &notification.message())
                {
                    warn!("Failed to show notification: {:#}", e);
                }
            });

        if let Err(e) = spawned {
            warn!("Failed to spawn notification thread: {}", e);
        }
    }
}

/// Send a system notification (platform-specific)
fn send_system_notification(title: &str, message: &str) -> anyhow::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::process::Command;
        Command::new("notify-send")
            .arg(title)
            .arg(message)
            .arg("--urgency=critical")
            .arg("--icon=dialog-warning")
            .output()?;
    }

    #[cfg(target_os = "macos")]
    {
        use std::process::Command;
        let script = format!(
            "display notification \"{}\" with title \"{}\" sound name \"Glass\"",
            message.replace('"', "'"),
            title
        );
        Command::new("osascript").arg("-e").arg(&script).output()?;
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        // No toast support without extra dependencies; the log line above stands in.
        let _ = (title, message);
    }

    Ok(())
}
