//! Thread-safe policy store shared by the front end and every enforcement loop.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

use super::{Credential, LogEntry, Profile};
use crate::error::{EngineError, EngineResult};

/// Outcome of an idempotent set mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Added,
    AlreadyPresent,
    Removed,
    NotFound,
}

impl Change {
    /// Whether the mutation actually modified the store.
    pub fn is_modified(self) -> bool {
        matches!(self, Change::Added | Change::Removed)
    }
}

/// The persistable part of the store.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct StoreContent {
    #[serde(default)]
    pub admin_credential: Credential,
    #[serde(default)]
    pub internet_disabled: bool,
    #[serde(default)]
    pub blocked_sites: BTreeSet<String>,
    #[serde(default)]
    pub blocked_apps: BTreeSet<String>,
    #[serde(default)]
    pub profiles: Vec<Profile>,
    /// Activity recorded while no profile was active.
    #[serde(default)]
    pub activity_log: Vec<LogEntry>,
    /// Calendar day (`%Y-%m-%d`) the usage counters belong to.
    #[serde(default)]
    pub usage_date: String,
}

/// Immutable view handed to the enforcement loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySnapshot {
    pub generation: u64,
    pub kill_switch: bool,
    pub active_profile: Option<String>,
    /// Global sites united with the active profile's sites.
    pub sites: BTreeSet<String>,
    /// Global apps united with the active profile's apps.
    pub apps: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    admin_credential: Credential,
    blocked_sites: BTreeSet<String>,
    blocked_apps: BTreeSet<String>,
    profiles: BTreeMap<String, Profile>,
    activity_log: Vec<LogEntry>,
    usage_date: String,
    active_profile: Option<String>,
    resolved: HashMap<String, BTreeSet<IpAddr>>,
}

impl Inner {
    fn profile_mut(&mut self, name: &str) -> EngineResult<&mut Profile> {
        self.profiles
            .get_mut(name)
            .ok_or_else(|| EngineError::ProfileNotFound(name.to_string()))
    }

    fn sites_mut(&mut self, profile: Option<&str>) -> EngineResult<&mut BTreeSet<String>> {
        match profile {
            Some(name) => Ok(&mut self.profile_mut(name)?.blocked_sites),
            None => Ok(&mut self.blocked_sites),
        }
    }

    fn blocks_site_anywhere(&self, domain: &str) -> bool {
        self.blocked_sites.contains(domain)
            || self
                .profiles
                .values()
                .any(|p| p.blocked_sites.contains(domain))
    }

    fn apps_mut(&mut self, profile: Option<&str>) -> EngineResult<&mut BTreeSet<String>> {
        match profile {
            Some(name) => Ok(&mut self.profile_mut(name)?.blocked_apps),
            None => Ok(&mut self.blocked_apps),
        }
    }
}

pub struct PolicyStore {
    inner: RwLock<Inner>,
    kill_switch: AtomicBool,
    generation: AtomicU64,
}

impl PolicyStore {
    pub fn new(content: StoreContent) -> Self {
        let profiles = content
            .profiles
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();

        Self {
            inner: RwLock::new(Inner {
                admin_credential: content.admin_credential,
                blocked_sites: content.blocked_sites,
                blocked_apps: content.blocked_apps,
                profiles,
                activity_log: content.activity_log,
                usage_date: content.usage_date,
                active_profile: None,
                resolved: HashMap::new(),
            }),
            kill_switch: AtomicBool::new(content.internet_disabled),
            generation: AtomicU64::new(0),
        }
    }

    /// Mutation counter; changes whenever the effective policy may have changed.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn kill_switch(&self) -> bool {
        self.kill_switch.load(Ordering::Acquire)
    }

    // Callers hold the write lock so generation order matches mutation order.
    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Consistent copy of the effective policy.
    pub fn snapshot(&self) -> PolicySnapshot {
        let inner = self.inner.read();
        let mut sites = inner.blocked_sites.clone();
        let mut apps = inner.blocked_apps.clone();

        if let Some(profile) = inner
            .active_profile
            .as_ref()
            .and_then(|name| inner.profiles.get(name))
        {
            sites.extend(profile.blocked_sites.iter().cloned());
            apps.extend(profile.blocked_apps.iter().cloned());
        }

        PolicySnapshot {
            generation: self.generation(),
            kill_switch: self.kill_switch(),
            active_profile: inner.active_profile.clone(),
            sites,
            apps,
        }
    }

    /// Copy of everything that gets persisted.
    pub fn content(&self) -> StoreContent {
        let inner = self.inner.read();
        StoreContent {
            admin_credential: inner.admin_credential.clone(),
            internet_disabled: self.kill_switch(),
            blocked_sites: inner.blocked_sites.clone(),
            blocked_apps: inner.blocked_apps.clone(),
            profiles: inner.profiles.values().cloned().collect(),
            activity_log: inner.activity_log.clone(),
            usage_date: inner.usage_date.clone(),
        }
    }

    pub fn add_site(&self, profile: Option<&str>, domain: &str) -> EngineResult<Change> {
        let mut inner = self.inner.write();
        let change = if inner.sites_mut(profile)?.insert(domain.to_string()) {
            self.bump();
            Change::Added
        } else {
            Change::AlreadyPresent
        };
        debug!("add site {} ({:?}): {:?}", domain, profile, change);
        Ok(change)
    }

    pub fn remove_site(&self, profile: Option<&str>, domain: &str) -> EngineResult<Change> {
        let mut inner = self.inner.write();
        let change = if inner.sites_mut(profile)?.remove(domain) {
            if !inner.blocks_site_anywhere(domain) {
                inner.resolved.remove(domain);
            }
            self.bump();
            Change::Removed
        } else {
            Change::NotFound
        };
        debug!("remove site {} ({:?}): {:?}", domain, profile, change);
        Ok(change)
    }

    pub fn add_app(&self, profile: Option<&str>, name: &str) -> EngineResult<Change> {
        let mut inner = self.inner.write();
        let change = if inner.apps_mut(profile)?.insert(name.to_string()) {
            self.bump();
            Change::Added
        } else {
            Change::AlreadyPresent
        };
        debug!("add app {} ({:?}): {:?}", name, profile, change);
        Ok(change)
    }

    pub fn remove_app(&self, profile: Option<&str>, name: &str) -> EngineResult<Change> {
        let mut inner = self.inner.write();
        let change = if inner.apps_mut(profile)?.remove(name) {
            self.bump();
            Change::Removed
        } else {
            Change::NotFound
        };
        debug!("remove app {} ({:?}): {:?}", name, profile, change);
        Ok(change)
    }

    /// Returns the previous value.
    pub fn set_kill_switch(&self, on: bool) -> bool {
        let _inner = self.inner.write();
        let previous = self.kill_switch.swap(on, Ordering::AcqRel);
        if previous != on {
            self.bump();
            info!("Internet kill switch {}", if on { "enabled" } else { "disabled" });
        }
        previous
    }

    pub fn admin_matches(&self, attempt: &str) -> bool {
        self.inner.read().admin_credential.matches(attempt)
    }

    pub fn has_admin_credential(&self) -> bool {
        !self.inner.read().admin_credential.is_empty()
    }

    pub fn set_admin_credential(&self, credential: Credential) {
        self.inner.write().admin_credential = credential;
    }

    /// Credential the lock gate expects right now.
    pub fn gate_credential(&self) -> Credential {
        let inner = self.inner.read();
        inner
            .active_profile
            .as_ref()
            .and_then(|name| inner.profiles.get(name))
            .map(|p| p.credential.clone())
            .unwrap_or_else(|| inner.admin_credential.clone())
    }

    pub fn verify_credential(&self, profile: &str, attempt: &str) -> EngineResult<bool> {
        let inner = self.inner.read();
        let profile = inner
            .profiles
            .get(profile)
            .ok_or_else(|| EngineError::ProfileNotFound(profile.to_string()))?;
        Ok(profile.credential.matches(attempt))
    }

    pub fn profile(&self, name: &str) -> Option<Profile> {
        self.inner.read().profiles.get(name).cloned()
    }

    pub fn profiles(&self) -> Vec<Profile> {
        self.inner.read().profiles.values().cloned().collect()
    }

    pub fn create_profile(&self, profile: Profile) -> EngineResult<()> {
        let mut inner = self.inner.write();
        if inner.profiles.contains_key(&profile.name) {
            return Err(EngineError::ProfileExists(profile.name));
        }
        info!("Created profile {}", profile.name);
        inner.profiles.insert(profile.name.clone(), profile);
        Ok(())
    }

    pub fn remove_profile(&self, name: &str) -> EngineResult<Profile> {
        let mut inner = self.inner.write();
        let profile = inner
            .profiles
            .remove(name)
            .ok_or_else(|| EngineError::ProfileNotFound(name.to_string()))?;
        if inner.active_profile.as_deref() == Some(name) {
            inner.active_profile = None;
        }
        self.bump();
        info!("Deleted profile {}", name);
        Ok(profile)
    }

    pub fn active_profile(&self) -> Option<String> {
        self.inner.read().active_profile.clone()
    }

    pub fn set_active_profile(&self, name: Option<&str>) -> EngineResult<()> {
        let mut inner = self.inner.write();
        if let Some(name) = name {
            if !inner.profiles.contains_key(name) {
                return Err(EngineError::ProfileNotFound(name.to_string()));
            }
        }
        if inner.active_profile.as_deref() != name {
            inner.active_profile = name.map(str::to_string);
            self.bump();
        }
        Ok(())
    }

    /// Raise a profile's used minutes. Returns `true` if the value changed.
    ///
    /// Never lowers the counter; only [`reset_usage`](Self::reset_usage) does.
    pub fn record_usage(&self, name: &str, used_minutes: u32) -> EngineResult<bool> {
        let mut inner = self.inner.write();
        let profile = inner.profile_mut(name)?;
        if used_minutes > profile.used_minutes {
            profile.used_minutes = used_minutes;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn reset_usage(&self, name: &str) -> EngineResult<()> {
        let mut inner = self.inner.write();
        inner.profile_mut(name)?.used_minutes = 0;
        info!("Reset usage for profile {}", name);
        Ok(())
    }

    /// Zero every profile's usage if `today` differs from the stored usage date.
    ///
    /// Returns `true` if a reset happened.
    pub fn roll_over_day(&self, today: &str) -> bool {
        let mut inner = self.inner.write();
        if inner.usage_date == today {
            return false;
        }
        for profile in inner.profiles.values_mut() {
            profile.used_minutes = 0;
        }
        info!(
            "New day ({} -> {}), usage counters reset",
            if inner.usage_date.is_empty() { "none" } else { &inner.usage_date },
            today
        );
        inner.usage_date = today.to_string();
        true
    }

    /// Append entries to the active profile's log (or the machine log), keeping at most `cap`.
    pub fn append_log(&self, entries: Vec<LogEntry>, cap: usize) {
        if entries.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        let Inner {
            active_profile,
            profiles,
            activity_log,
            ..
        } = &mut *inner;

        let log = match active_profile.as_ref().and_then(|n| profiles.get_mut(n)) {
            Some(profile) => &mut profile.activity_log,
            None => activity_log,
        };
        log.extend(entries);
        if log.len() > cap {
            let excess = log.len() - cap;
            log.drain(..excess);
        }
    }

    pub fn machine_log(&self) -> Vec<LogEntry> {
        self.inner.read().activity_log.clone()
    }

    pub fn set_resolved(&self, domain: &str, ips: BTreeSet<IpAddr>) {
        self.inner.write().resolved.insert(domain.to_string(), ips);
    }

    pub fn resolved(&self, domain: &str) -> Option<BTreeSet<IpAddr>> {
        self.inner.read().resolved.get(domain).cloned()
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new(StoreContent::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Credential, LogKind};

    fn make_test_store() -> PolicyStore {
        let mut content = StoreContent {
            admin_credential: Credential::new("1234"),
            ..Default::default()
        };
        content
            .profiles
            .push(Profile::new("alice", 10, Credential::new("alice-pw"), 60));
        PolicyStore::new(content)
    }

    #[test]
    fn add_site_is_idempotent() {
        let store = make_test_store();
        assert_eq!(store.add_site(None, "example.com").unwrap(), Change::Added);
        let generation = store.generation();
        assert_eq!(
            store.add_site(None, "example.com").unwrap(),
            Change::AlreadyPresent
        );
        assert_eq!(store.generation(), generation);
        assert_eq!(store.snapshot().sites.len(), 1);
    }

    #[test]
    fn resolved_addresses_kept_while_another_set_blocks_the_site() {
        let store = make_test_store();
        let ips = BTreeSet::from(["10.0.0.1".parse::<IpAddr>().unwrap()]);
        store.add_site(None, "games.example").unwrap();
        store.add_site(Some("alice"), "games.example").unwrap();
        store.set_resolved("games.example", ips.clone());

        store.remove_site(Some("alice"), "games.example").unwrap();
        assert_eq!(store.resolved("games.example"), Some(ips));

        store.remove_site(None, "games.example").unwrap();
        assert_eq!(store.resolved("games.example"), None);
    }

    #[test]
    fn remove_missing_reports_not_found() {
        let store = make_test_store();
        assert_eq!(store.remove_site(None, "nope.com").unwrap(), Change::NotFound);
        assert_eq!(store.remove_app(None, "calc.exe").unwrap(), Change::NotFound);
    }

    #[test]
    fn add_app_is_idempotent() {
        let store = make_test_store();
        assert_eq!(store.add_app(None, "calc.exe").unwrap(), Change::Added);
        assert_eq!(store.add_app(None, "calc.exe").unwrap(), Change::AlreadyPresent);
        assert_eq!(store.remove_app(None, "calc.exe").unwrap(), Change::Removed);
        assert!(store.snapshot().apps.is_empty());
    }

    #[test]
    fn profile_sets_apply_only_while_active() {
        let store = make_test_store();
        store.add_site(Some("alice"), "games.com").unwrap();
        store.add_app(None, "calc.exe").unwrap();

        assert!(!store.snapshot().sites.contains("games.com"));

        store.set_active_profile(Some("alice")).unwrap();
        let snapshot = store.snapshot();
        assert!(snapshot.sites.contains("games.com"));
        assert!(snapshot.apps.contains("calc.exe"));
        assert_eq!(snapshot.active_profile.as_deref(), Some("alice"));
    }

    #[test]
    fn profile_mutation_requires_existing_profile() {
        let store = make_test_store();
        let err = store.add_site(Some("bob"), "example.com").unwrap_err();
        assert_eq!(err.kind(), "ProfileNotFound");
        assert!(store.set_active_profile(Some("bob")).is_err());
    }

    #[test]
    fn kill_switch_bumps_generation_once() {
        let store = make_test_store();
        let start = store.generation();
        assert!(!store.set_kill_switch(true));
        assert!(store.set_kill_switch(true));
        assert_eq!(store.generation(), start + 1);
        assert!(store.snapshot().kill_switch);
    }

    #[test]
    fn record_usage_never_decreases() {
        let store = make_test_store();
        assert!(store.record_usage("alice", 5).unwrap());
        assert!(!store.record_usage("alice", 3).unwrap());
        assert_eq!(store.profile("alice").unwrap().used_minutes, 5);

        store.reset_usage("alice").unwrap();
        assert_eq!(store.profile("alice").unwrap().used_minutes, 0);
    }

    #[test]
    fn roll_over_day_resets_usage() {
        let store = make_test_store();
        store.roll_over_day("2024-01-01");
        store.record_usage("alice", 30).unwrap();

        assert!(!store.roll_over_day("2024-01-01"));
        assert_eq!(store.profile("alice").unwrap().used_minutes, 30);

        assert!(store.roll_over_day("2024-01-02"));
        assert_eq!(store.profile("alice").unwrap().used_minutes, 0);
    }

    #[test]
    fn gate_credential_follows_active_profile() {
        let store = make_test_store();
        assert!(store.gate_credential().matches("1234"));
        store.set_active_profile(Some("alice")).unwrap();
        assert!(store.gate_credential().matches("alice-pw"));
    }

    #[test]
    fn log_is_capped_oldest_first() {
        let store = make_test_store();
        let entries = (0..5)
            .map(|i| LogEntry::now(LogKind::ProcessStart, format!("p{i}")))
            .collect();
        store.append_log(entries, 3);

        let log = store.machine_log();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].subject, "p2");
        assert_eq!(log[2].subject, "p4");
    }

    #[test]
    fn content_round_trips_through_new() {
        let store = make_test_store();
        store.add_site(None, "example.com").unwrap();
        store.add_app(Some("alice"), "game.exe").unwrap();
        store.set_kill_switch(true);

        let content = store.content();
        let reloaded = PolicyStore::new(content.clone());
        assert_eq!(reloaded.content(), content);
    }

    #[test]
    fn remove_profile_clears_active() {
        let store = make_test_store();
        store.set_active_profile(Some("alice")).unwrap();
        store.remove_profile("alice").unwrap();
        assert_eq!(store.active_profile(), None);
        assert_eq!(
            store.remove_profile("alice").unwrap_err().kind(),
            "ProfileNotFound"
        );
    }
}
