//! The engine facade: owns the policy store and every enforcement loop.
//!
//! Front ends talk to [`Engine`] only. Mutations are persisted through the
//! configured [`Checkpoint`] as soon as they succeed.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::enforcement::{
    ActivityMonitor, CoreProcesses, DomainResolver, FilterControl, FilterSettings, FilterState,
    Interceptor, PacketFilterEngine, PlatformInterceptor, ProcessEnforcer, ProcessTable, Resolver,
    SystemProcessTable, SystemResolver,
};
use crate::error::{EngineError, EngineResult};
use crate::lifecycle::{LoopHandle, StartOutcome};
use crate::notify::{DesktopNotifier, LogNotifier, Notifier};
use crate::policy::{
    Change, Credential, PolicyStore, Profile, StoreContent, normalize_app, normalize_domain,
};
use crate::state::{Checkpoint, StateFile, today};
use crate::time_limits::{
    GateSettings, GateState, LockGate, LockReason, PointerDevice, SessionStatus, SessionTimer,
    UnlockOutcome, platform_pointer,
};

/// Upper bound on waiting for a tokio loop to finish its current cycle.
const TASK_STOP_BOUND: Duration = Duration::from_secs(5);

/// Everything the engine needs from the outside world.
pub struct Collaborators<I: Interceptor> {
    pub interceptor: Arc<I>,
    pub resolver: Arc<dyn Resolver>,
    /// Process table the application enforcer lists and kills through.
    pub processes: Arc<dyn ProcessTable>,
    /// Process table the activity monitor lists through. A separate
    /// instance keeps a stalled kill from holding up activity logging.
    pub activity_processes: Arc<dyn ProcessTable>,
    pub pointer: Arc<dyn PointerDevice>,
    pub notifier: Arc<dyn Notifier>,
    pub checkpoint: Arc<dyn Checkpoint>,
}

impl Collaborators<PlatformInterceptor> {
    /// The real operating-system collaborators, checkpointing to `state`.
    pub fn system(config: &EngineConfig, state: StateFile) -> Self {
        let notifier: Arc<dyn Notifier> = if config.notifications.enabled {
            Arc::new(DesktopNotifier)
        } else {
            Arc::new(LogNotifier)
        };

        Self {
            interceptor: Arc::new(PlatformInterceptor::default()),
            resolver: Arc::new(SystemResolver),
            processes: Arc::new(SystemProcessTable::new()),
            activity_processes: Arc::new(SystemProcessTable::new()),
            pointer: platform_pointer(),
            notifier,
            checkpoint: Arc::new(state),
        }
    }
}

/// Point-in-time view of the engine for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub filter: FilterState,
    pub kill_switch: bool,
    pub app_blocking: bool,
    pub monitoring: bool,
    pub session: SessionStatus,
    pub gate: GateState,
    pub lock_reason: Option<LockReason>,
    pub locked_at: Option<DateTime<Utc>>,
    pub active_profile: Option<String>,
    pub blocked_sites: usize,
    pub blocked_apps: usize,
    pub generation: u64,
}

pub struct Engine {
    store: Arc<PolicyStore>,
    filter: Box<dyn FilterControl>,
    enforcer: ProcessEnforcer,
    monitor: ActivityMonitor,
    timer: SessionTimer,
    gate: Arc<LockGate>,
    checkpoint: Arc<dyn Checkpoint>,
    stop_bound: Duration,
}

impl Engine {
    pub fn new<I: Interceptor>(
        config: &EngineConfig,
        content: StoreContent,
        collaborators: Collaborators<I>,
        runtime: Handle,
    ) -> Self {
        let Collaborators {
            interceptor,
            resolver,
            processes,
            activity_processes,
            pointer,
            notifier,
            checkpoint,
        } = collaborators;

        let store = Arc::new(PolicyStore::new(content));
        if store.roll_over_day(&today()) {
            if let Err(e) = checkpoint.save(&store.content()) {
                warn!("Failed to save state after daily reset: {:#}", e);
            }
        }

        let filter = PacketFilterEngine::new(
            interceptor,
            store.clone(),
            Arc::new(DomainResolver::new(resolver)),
            FilterSettings {
                filter: config.filter.clone(),
                refresh: config.dns_refresh(),
                recv_timeout: config.filter_recv_timeout(),
                max_log_entries: config.activity.max_log_entries,
            },
        );

        let enforcer = ProcessEnforcer::new(
            processes,
            store.clone(),
            notifier.clone(),
            config.check_interval(),
            runtime.clone(),
        );

        let monitor = ActivityMonitor::new(
            activity_processes,
            store.clone(),
            CoreProcesses::new(&config.activity.core_processes),
            config.check_interval(),
            config.activity.max_log_entries,
            runtime.clone(),
        );

        let gate = Arc::new(LockGate::new(
            pointer,
            GateSettings {
                region: config.lock.region,
                poll_interval: Duration::from_millis(config.lock.poll_interval_ms),
                join_timeout: Duration::from_millis(config.lock.join_timeout_ms),
            },
        ));

        let timer = SessionTimer::new(
            store.clone(),
            gate.clone(),
            checkpoint.clone(),
            notifier,
            runtime,
        );

        // A blocking cycle may take a full check interval to notice the stop.
        let stop_bound = TASK_STOP_BOUND.max(config.check_interval() * 2);

        Self {
            store,
            filter: Box::new(filter),
            enforcer,
            monitor,
            timer,
            gate,
            checkpoint,
            stop_bound,
        }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Persist the current policy store.
    pub fn checkpoint(&self) -> EngineResult<()> {
        self.checkpoint.save(&self.store.content())?;
        Ok(())
    }

    fn persist_if(&self, change: Change) -> EngineResult<Change> {
        if change.is_modified() {
            self.checkpoint()?;
        }
        Ok(change)
    }

    /// Persist after a change the caller has no use for the error of.
    fn checkpoint_or_warn(&self, what: &str) {
        if let Err(e) = self.checkpoint() {
            warn!("Failed to save state after {}: {}", what, e);
        }
    }

    // Sites and applications. `profile` of `None` edits the global sets.

    pub fn add_site(&self, profile: Option<&str>, site: &str) -> EngineResult<Change> {
        let domain = normalize_domain(site)?;
        let change = self.store.add_site(profile, &domain)?;
        self.persist_if(change)
    }

    pub fn remove_site(&self, profile: Option<&str>, site: &str) -> EngineResult<Change> {
        let domain = normalize_domain(site)?;
        let change = self.store.remove_site(profile, &domain)?;
        self.persist_if(change)
    }

    pub fn add_app(&self, profile: Option<&str>, app: &str) -> EngineResult<Change> {
        let name = normalize_app(app)?;
        let change = self.store.add_app(profile, &name)?;
        self.persist_if(change)
    }

    pub fn remove_app(&self, profile: Option<&str>, app: &str) -> EngineResult<Change> {
        let name = normalize_app(app)?;
        let change = self.store.remove_app(profile, &name)?;
        self.persist_if(change)
    }

    /// Turn the internet kill switch on or off. Returns the previous value.
    ///
    /// The switch is enforced by the packet filter, so turning it on starts
    /// the filter if it is idle. The flag is kept even when the filter cannot
    /// start; the start error is returned.
    pub fn set_kill_switch(&self, on: bool) -> EngineResult<bool> {
        let previous = self.store.set_kill_switch(on);
        if previous != on {
            self.checkpoint()?;
        }
        if on && self.filter.state() == FilterState::Idle {
            self.filter.start()?;
        }
        Ok(previous)
    }

    // Background loops

    pub fn start_blocking(&self) -> EngineResult<StartOutcome> {
        self.filter.start()
    }

    /// Returns `false` if the filter was not running.
    pub async fn stop_blocking(&self) -> bool {
        match self.filter.stop() {
            Some(handle) => handle.wait("packet filter", self.stop_bound).await,
            None => false,
        }
    }

    pub fn start_app_blocking(&self) -> StartOutcome {
        self.enforcer.start()
    }

    pub async fn stop_app_blocking(&self) -> bool {
        match self.enforcer.stop() {
            Some(handle) => handle.wait("application blocking", self.stop_bound).await,
            None => false,
        }
    }

    pub fn start_monitoring(&self) -> StartOutcome {
        self.monitor.start()
    }

    pub async fn stop_monitoring(&self) -> bool {
        match self.monitor.stop() {
            Some(handle) => handle.wait("activity monitor", self.stop_bound).await,
            None => false,
        }
    }

    // Sessions and the lock gate

    /// Start a timed session for `profile`. Returns the seconds granted.
    pub fn start_session(&self, profile: &str) -> EngineResult<u64> {
        if self.gate.is_locked() {
            return Err(EngineError::SessionRejected("the screen is locked".into()));
        }
        let granted = self.timer.start(profile)?;
        self.checkpoint_or_warn("session start");
        Ok(granted)
    }

    /// End the running session. Returns `false` if none was running.
    pub async fn stop_session(&self) -> bool {
        let handle = self.timer.stop();
        let stopped = match handle {
            Some(handle) => handle.wait("session timer", self.stop_bound).await,
            None => false,
        };
        self.checkpoint_or_warn("session stop");
        stopped
    }

    pub fn session(&self) -> SessionStatus {
        self.timer.status()
    }

    /// Seconds of allowance left today for `profile`.
    ///
    /// Live from the timer while the profile's session runs; otherwise
    /// computed from the stored usage.
    pub fn query_remaining_time(&self, profile: &str) -> EngineResult<u64> {
        if let Some(remaining) = self.timer.running_remaining(profile) {
            return Ok(remaining);
        }
        if self.store.roll_over_day(&today()) {
            self.checkpoint_or_warn("daily reset");
        }
        let record = self
            .store
            .profile(profile)
            .ok_or_else(|| EngineError::ProfileNotFound(profile.to_string()))?;
        Ok(u64::from(record.remaining_minutes()) * 60)
    }

    pub fn verify_credential(&self, profile: &str, attempt: &str) -> EngineResult<bool> {
        self.store.verify_credential(profile, attempt)
    }

    /// Lock the screen now. Returns `false` if it was already locked.
    pub fn lock_now(&self) -> bool {
        self.gate
            .lock(LockReason::Administrative, self.store.gate_credential(), None)
    }

    pub fn unlock(&self, attempt: &str) -> EngineResult<UnlockOutcome> {
        let outcome = self.gate.unlock(attempt)?;
        if outcome == UnlockOutcome::Unlocked {
            self.checkpoint_or_warn("unlock");
        }
        Ok(outcome)
    }

    pub fn is_locked(&self) -> bool {
        self.gate.is_locked()
    }

    // Profiles and credentials

    fn require_admin(&self, attempt: &str) -> EngineResult<()> {
        if !self.store.has_admin_credential() {
            return Err(EngineError::InvalidInput(
                "no admin credential is set; run `family-guard init` first".into(),
            ));
        }
        if !self.store.admin_matches(attempt) {
            return Err(EngineError::CredentialMismatch);
        }
        Ok(())
    }

    /// Create a profile. Requires the admin credential.
    pub fn create_profile(&self, admin_attempt: &str, profile: Profile) -> EngineResult<()> {
        self.require_admin(admin_attempt)?;
        if profile.name.trim().is_empty() {
            return Err(EngineError::InvalidInput("profile name must not be empty".into()));
        }
        if profile.credential.is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "profile {} needs a password",
                profile.name
            )));
        }
        self.store.create_profile(profile)?;
        self.checkpoint()
    }

    /// Delete a profile. Requires that profile's own credential.
    pub fn delete_profile(&self, name: &str, attempt: &str) -> EngineResult<Profile> {
        if !self.store.verify_credential(name, attempt)? {
            return Err(EngineError::CredentialMismatch);
        }
        if self.timer.running_remaining(name).is_some() {
            // The task sees the stop on its next tick; no need to wait for it.
            drop(self.timer.stop());
        }
        let removed = self.store.remove_profile(name)?;
        self.checkpoint()?;
        Ok(removed)
    }

    /// Zero a profile's usage for today. Requires the admin credential.
    pub fn reset_usage(&self, admin_attempt: &str, name: &str) -> EngineResult<()> {
        self.require_admin(admin_attempt)?;
        self.store.reset_usage(name)?;
        self.checkpoint()
    }

    /// Set the admin credential. Once one is set, `current` must match it.
    pub fn set_admin_credential(&self, current: &str, new: &str) -> EngineResult<()> {
        if self.store.has_admin_credential() && !self.store.admin_matches(current) {
            return Err(EngineError::CredentialMismatch);
        }
        if new.is_empty() {
            return Err(EngineError::InvalidInput("password must not be empty".into()));
        }
        self.store.set_admin_credential(Credential::new(new));
        self.checkpoint()
    }

    pub fn status(&self) -> EngineStatus {
        let snapshot = self.store.snapshot();
        EngineStatus {
            filter: self.filter.state(),
            kill_switch: snapshot.kill_switch,
            app_blocking: self.enforcer.is_running(),
            monitoring: self.monitor.is_running(),
            session: self.timer.status(),
            gate: self.gate.state(),
            lock_reason: self.gate.reason(),
            locked_at: self.gate.locked_at(),
            active_profile: snapshot.active_profile,
            blocked_sites: snapshot.sites.len(),
            blocked_apps: snapshot.apps.len(),
            generation: snapshot.generation,
        }
    }

    /// Stop every loop, waiting a bounded time for each, then save state.
    ///
    /// The lock gate is left as is; it releases the pointer when dropped.
    pub async fn shutdown(&self) -> EngineResult<()> {
        info!("Shutting down enforcement engine");
        let handles: Vec<(&str, Option<LoopHandle>)> = vec![
            ("session timer", self.timer.stop()),
            ("application blocking", self.enforcer.stop()),
            ("activity monitor", self.monitor.stop()),
            ("packet filter", self.filter.stop()),
        ];

        for (name, handle) in handles {
            if let Some(handle) = handle {
                handle.wait(name, self.stop_bound).await;
            }
        }

        self.checkpoint()?;
        info!("Engine stopped");
        Ok(())
    }
}

/// Load the state file and build an engine on the system collaborators.
pub fn system_engine(config: &EngineConfig, runtime: Handle) -> Result<Engine> {
    let state = StateFile::new(config.resolve_state_path()?);
    let content = state.load_or_default()?;
    info!("Loaded state from {}", state.path().display());
    Ok(Engine::new(
        config,
        content,
        Collaborators::system(config, state),
        runtime,
    ))
}
