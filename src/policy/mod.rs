//! Policy data model: profiles, credentials and activity log entries.

pub mod store;

pub use store::{Change, PolicySnapshot, PolicyStore, StoreContent};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use url::{Host, Url};

use crate::error::{EngineError, EngineResult};

/// Shared secret used to unlock the gate or authorise administrative actions.
///
/// Stored in plain text and compared exactly. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn matches(&self, attempt: &str) -> bool {
        self.0 == attempt
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// A managed user with its own time budget and blocked lists.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Profile {
    pub name: String,
    pub age: u8,
    pub credential: Credential,
    pub daily_limit_minutes: u32,
    #[serde(default)]
    pub used_minutes: u32,
    #[serde(default)]
    pub blocked_sites: BTreeSet<String>,
    #[serde(default)]
    pub blocked_apps: BTreeSet<String>,
    #[serde(default)]
    pub activity_log: Vec<LogEntry>,
}

impl Profile {
    pub fn new(
        name: impl Into<String>,
        age: u8,
        credential: Credential,
        daily_limit_minutes: u32,
    ) -> Self {
        Self {
            name: name.into(),
            age,
            credential,
            daily_limit_minutes,
            used_minutes: 0,
            blocked_sites: BTreeSet::new(),
            blocked_apps: BTreeSet::new(),
            activity_log: Vec::new(),
        }
    }

    /// Minutes left in today's budget.
    pub fn remaining_minutes(&self) -> u32 {
        self.daily_limit_minutes.saturating_sub(self.used_minutes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    ProcessStart,
    ProcessEnd,
    SiteVisit,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogKind::ProcessStart => "process started",
            LogKind::ProcessEnd => "process ended",
            LogKind::SiteVisit => "site visit",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: LogKind,
    pub subject: String,
}

impl LogEntry {
    pub fn now(kind: LogKind, subject: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            subject: subject.into(),
        }
    }
}

/// Reduce a bare host or URL to the lower-cased host name used as a policy key.
pub fn normalize_domain(input: &str) -> EngineResult<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidInput("domain must not be empty".into()));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };

    let url = Url::parse(&candidate)
        .map_err(|e| EngineError::InvalidInput(format!("invalid domain '{trimmed}': {e}")))?;

    let host = match url.host() {
        Some(Host::Domain(domain)) => domain.trim_end_matches('.').to_lowercase(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => String::new(),
    };

    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(EngineError::InvalidInput(format!(
            "invalid domain '{trimmed}'"
        )));
    }

    Ok(host)
}

/// Application names are matched exactly; only surrounding whitespace is dropped.
pub fn normalize_app(input: &str) -> EngineResult<String> {
    let name = input.trim();
    if name.is_empty() {
        return Err(EngineError::InvalidInput(
            "application name must not be empty".into(),
        ));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bare_host() {
        assert_eq!(normalize_domain("Example.COM").unwrap(), "example.com");
        assert_eq!(normalize_domain("  example.com.  ").unwrap(), "example.com");
    }

    #[test]
    fn normalize_url_extracts_host() {
        assert_eq!(
            normalize_domain("https://www.YouTube.com/watch?v=1").unwrap(),
            "www.youtube.com"
        );
        assert_eq!(normalize_domain("example.com:8080/path").unwrap(), "example.com");
    }

    #[test]
    fn normalize_ip_literal() {
        assert_eq!(normalize_domain("10.0.0.1").unwrap(), "10.0.0.1");
    }

    #[test]
    fn normalize_rejects_garbage() {
        assert!(normalize_domain("").is_err());
        assert!(normalize_domain("   ").is_err());
        assert!(normalize_domain("http://").is_err());
        assert!(normalize_domain("exa mple.com").is_err());
    }

    #[test]
    fn app_names_are_kept_verbatim() {
        assert_eq!(normalize_app(" calc.exe ").unwrap(), "calc.exe");
        assert_eq!(normalize_app("Calc.EXE").unwrap(), "Calc.EXE");
        assert!(normalize_app("").is_err());
    }

    #[test]
    fn credential_debug_is_redacted() {
        let credential = Credential::new("1234");
        assert_eq!(format!("{:?}", credential), "Credential(***)");
        assert!(credential.matches("1234"));
        assert!(!credential.matches("12345"));
    }

    #[test]
    fn remaining_minutes_saturates() {
        let mut profile = Profile::new("kid", 9, Credential::new("pw"), 30);
        profile.used_minutes = 45;
        assert_eq!(profile.remaining_minutes(), 0);
    }
}
