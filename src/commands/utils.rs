use anyhow::{Context, Result};
use chrono::Duration;
use std::path::PathBuf;

use family_guard::config::{self, EngineConfig};
use family_guard::engine::{Engine, system_engine};

/// Initialize logging
pub fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let level = if verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

/// Load the engine configuration, applying command-line overrides
pub fn load_engine_config(
    config_path: Option<PathBuf>,
    state_path: Option<PathBuf>,
) -> Result<EngineConfig> {
    let path = match config_path {
        Some(path) => path,
        None => config::get_config_path()?,
    };

    let mut config = config::load_config_or_default(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

    if state_path.is_some() {
        config.state_path = state_path;
    }

    Ok(config)
}

/// Build the multi-threaded runtime the engine's loops run on
pub fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

/// Open the stored policy for editing without starting any enforcement
///
/// The runtime must outlive the engine.
pub fn open_engine(config: &EngineConfig) -> Result<(tokio::runtime::Runtime, Engine)> {
    let runtime = build_runtime()?;
    let engine = system_engine(config, runtime.handle().clone())?;
    Ok((runtime, engine))
}

/// Format duration for display
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.num_seconds();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}

/// Format a remaining allowance as `1h 05m` or `12m 30s`
pub fn format_remaining(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else {
        format!("{}m {:02}s", minutes, secs)
    }
}

/// Print sudo message based on OS
pub fn print_sudo_message() {
    #[cfg(unix)]
    {
        let program = std::env::args()
            .next()
            .unwrap_or_else(|| "family-guard".to_string());
        eprintln!("Please run with sudo: sudo {}", program);
    }

    #[cfg(windows)]
    eprintln!("Please run this program as Administrator.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::seconds(42)), "42s");
        assert_eq!(format_duration(Duration::seconds(150)), "2m");
        assert_eq!(format_duration(Duration::hours(5)), "5h");
        assert_eq!(format_duration(Duration::days(2)), "2d");
    }

    #[test]
    fn test_format_remaining() {
        assert_eq!(format_remaining(0), "0m 00s");
        assert_eq!(format_remaining(750), "12m 30s");
        assert_eq!(format_remaining(3900), "1h 05m");
    }

    #[test]
    fn test_state_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, "state_path: /tmp/elsewhere.json\n").unwrap();

        let config = load_engine_config(
            Some(config_path),
            Some(dir.path().join("state.json")),
        )
        .unwrap();
        assert_eq!(config.state_path, Some(dir.path().join("state.json")));
    }
}
