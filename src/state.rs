use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::policy::StoreContent;

/// Current state version
const STATE_VERSION: &str = "1.0";

/// On-disk wrapper around the policy store content
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PersistedState {
    pub version: String,
    pub saved_at: DateTime<Utc>,
    #[serde(flatten)]
    pub content: StoreContent,
}

/// Today's date in the `%Y-%m-%d` form used for daily usage resets
pub fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

/// Get the platform-specific state file path
pub fn get_state_path() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        // Try system location first, fall back to user location
        let system_path = PathBuf::from("/var/lib/family-guard/state.json");
        if system_path.parent().map(|p| p.exists()).unwrap_or(false) {
            return Ok(system_path);
        }

        if let Some(data_dir) = directories::ProjectDirs::from("", "", "family-guard") {
            let mut path = data_dir.data_local_dir().to_path_buf();
            path.push("state.json");
            return Ok(path);
        }

        anyhow::bail!("Could not determine state file location");
    }

    #[cfg(target_os = "macos")]
    {
        Ok(PathBuf::from(
            "/Library/Application Support/family-guard/state.json",
        ))
    }

    #[cfg(target_os = "windows")]
    {
        let mut path = PathBuf::from(
            std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_string()),
        );
        path.push("family-guard");
        path.push("state.json");
        Ok(path)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        anyhow::bail!("Unsupported operating system");
    }
}

/// Load state from `path`
///
/// Returns `None` when the file does not exist or was written by an
/// incompatible version.
pub fn load_state(path: &Path) -> Result<Option<StoreContent>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file: {}", path.display()))?;

    let state: PersistedState = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

    if state.version != STATE_VERSION {
        warn!(
            "State file version mismatch (expected {}, got {}). Treating as new state.",
            STATE_VERSION, state.version
        );
        return Ok(None);
    }

    Ok(Some(state.content))
}

/// Save state to `path` atomically
pub fn save_state(path: &Path, content: &StoreContent) -> Result<()> {
    let state = PersistedState {
        version: STATE_VERSION.to_string(),
        saved_at: Utc::now(),
        content: content.clone(),
    };

    let json = serde_json::to_string_pretty(&state).context("Failed to serialize state")?;

    crate::platform::common::atomic_write_private(path, json.as_bytes())
        .with_context(|| format!("Failed to write state file: {}", path.display()))?;

    debug!("State saved to {}", path.display());
    Ok(())
}

/// Durable storage for the policy store.
pub trait Checkpoint: Send + Sync {
    fn save(&self, content: &StoreContent) -> Result<()>;
}

/// Checkpoints to a JSON state file.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load existing content, or a fresh store stamped with today's date.
    pub fn load_or_default(&self) -> Result<StoreContent> {
        Ok(load_state(&self.path)?.unwrap_or_else(|| StoreContent {
            usage_date: today(),
            ..Default::default()
        }))
    }
}

impl Checkpoint for StateFile {
    fn save(&self, content: &StoreContent) -> Result<()> {
        save_state(&self.path, content)
    }
}

/// Keeps checkpoints in memory; useful for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpoint {
    saved: Mutex<Vec<StoreContent>>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<StoreContent> {
        self.saved.lock().clone()
    }

    pub fn last(&self) -> Option<StoreContent> {
        self.saved.lock().last().cloned()
    }
}

impl Checkpoint for MemoryCheckpoint {
    fn save(&self, content: &StoreContent) -> Result<()> {
        self.saved.lock().push(content.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Credential, LogEntry, LogKind, PolicyStore, Profile};
    use tempfile::tempdir;

    fn make_test_content() -> StoreContent {
        let mut profile = Profile::new("alice", 10, Credential::new("pw"), 90);
        profile.used_minutes = 12;
        profile.blocked_sites.insert("games.com".into());
        profile.blocked_apps.insert("game.exe".into());
        profile
            .activity_log
            .push(LogEntry::now(LogKind::SiteVisit, "games.com"));

        StoreContent {
            admin_credential: Credential::new("1234"),
            internet_disabled: true,
            blocked_sites: ["example.com".to_string()].into(),
            blocked_apps: ["calc.exe".to_string()].into(),
            profiles: vec![profile],
            activity_log: Vec::new(),
            usage_date: "2024-05-01".into(),
        }
    }

    #[test]
    fn test_save_then_load_reproduces_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = PolicyStore::new(make_test_content());

        save_state(&path, &store.content()).unwrap();
        let loaded = load_state(&path).unwrap().unwrap();

        assert_eq!(PolicyStore::new(loaded).content(), store.content());
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempdir().unwrap();
        assert!(load_state(&dir.path().join("missing.json")).unwrap().is_none());
    }

    #[test]
    fn test_version_mismatch_is_fresh_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        save_state(&path, &make_test_content()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("\"1.0\"", "\"0.1\"")).unwrap();

        assert!(load_state(&path).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_state(&path).is_err());
    }

    #[test]
    fn test_sets_are_sorted_lists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut content = make_test_content();
        content.blocked_sites = ["b.com".to_string(), "a.com".to_string()].into();
        save_state(&path, &content).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["blocked_sites"], serde_json::json!(["a.com", "b.com"]));
        assert_eq!(json["version"], "1.0");
    }

    #[test]
    fn test_state_file_default_is_stamped_today() {
        let dir = tempdir().unwrap();
        let file = StateFile::new(dir.path().join("nested").join("state.json"));
        let content = file.load_or_default().unwrap();
        assert_eq!(content.usage_date, today());

        file.save(&content).unwrap();
        assert!(file.path().exists());
    }
}
