//! Per-session countdown that charges a profile's daily budget.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::gate::{Continuation, LockGate, LockReason};
use crate::error::{EngineError, EngineResult};
use crate::lifecycle::LoopHandle;
use crate::notify::{Notification, Notifier};
use crate::policy::PolicyStore;
use crate::state::{today, Checkpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    Idle,
    Running,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub profile: Option<String>,
    pub remaining_seconds: u64,
    pub phase: TimerPhase,
}

#[derive(Debug)]
struct SessionState {
    profile: Option<String>,
    daily_limit_minutes: u32,
    remaining_seconds: u64,
    phase: TimerPhase,
}

impl SessionState {
    fn idle() -> Self {
        Self {
            profile: None,
            daily_limit_minutes: 0,
            remaining_seconds: 0,
            phase: TimerPhase::Idle,
        }
    }

    /// Minutes charged so far; a started minute counts as used.
    fn used_minutes(&self) -> u32 {
        let remaining_minutes = u32::try_from(self.remaining_seconds / 60).unwrap_or(u32::MAX);
        self.daily_limit_minutes.saturating_sub(remaining_minutes)
    }
}

enum Tick {
    Continue,
    Expired { profile: String },
    Ended,
}

struct RunningTimer {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct SessionTimer {
    store: Arc<PolicyStore>,
    gate: Arc<LockGate>,
    checkpoint: Arc<dyn Checkpoint>,
    notifier: Arc<dyn Notifier>,
    tick: Duration,
    runtime: Handle,
    state: Arc<Mutex<SessionState>>,
    running: Mutex<Option<RunningTimer>>,
}

impl SessionTimer {
    pub fn new(
        store: Arc<PolicyStore>,
        gate: Arc<LockGate>,
        checkpoint: Arc<dyn Checkpoint>,
        notifier: Arc<dyn Notifier>,
        runtime: Handle,
    ) -> Self {
        Self {
            store,
            gate,
            checkpoint,
            notifier,
            tick: Duration::from_secs(1),
            runtime,
            state: Arc::new(Mutex::new(SessionState::idle())),
            running: Mutex::new(None),
        }
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.state.lock();
        SessionStatus {
            profile: state.profile.clone(),
            remaining_seconds: state.remaining_seconds,
            phase: state.phase,
        }
    }

    /// Seconds left for `profile` if its session is the one running.
    pub fn running_remaining(&self, profile: &str) -> Option<u64> {
        let state = self.state.lock();
        (state.phase == TimerPhase::Running && state.profile.as_deref() == Some(profile))
            .then_some(state.remaining_seconds)
    }

    /// Start a session for `profile`. Returns the seconds granted.
    pub fn start(&self, profile: &str) -> EngineResult<u64> {
        let mut running = self.running.lock();
        let mut state = self.state.lock();

        if state.phase == TimerPhase::Running {
            return Err(EngineError::AlreadyRunning(format!(
                "a session for {}",
                state.profile.as_deref().unwrap_or("another profile")
            )));
        }

        self.store.roll_over_day(&today());
        let record = self
            .store
            .profile(profile)
            .ok_or_else(|| EngineError::ProfileNotFound(profile.to_string()))?;

        let remaining_minutes = record.remaining_minutes();
        if remaining_minutes == 0 {
            return Err(EngineError::SessionRejected(format!(
                "{} has no time left today",
                profile
            )));
        }

        self.store.set_active_profile(Some(profile))?;
        *state = SessionState {
            profile: Some(profile.to_string()),
            daily_limit_minutes: record.daily_limit_minutes,
            remaining_seconds: u64::from(remaining_minutes) * 60,
            phase: TimerPhase::Running,
        };
        let granted = state.remaining_seconds;
        drop(state);

        // A leftover task from an expired session has already exited.
        let (stop, stop_rx) = watch::channel(false);
        let handle = self.runtime.spawn(run_timer(
            self.state.clone(),
            self.store.clone(),
            self.gate.clone(),
            self.checkpoint.clone(),
            self.notifier.clone(),
            self.tick,
            stop_rx,
        ));
        *running = Some(RunningTimer { stop, handle });

        info!("Session started for {} ({} minutes left)", profile, remaining_minutes);
        self.notifier.notify(Notification::SessionStarted {
            profile: profile.to_string(),
            remaining_minutes,
        });
        Ok(granted)
    }

    /// End the current session and return to Idle.
    pub fn stop(&self) -> Option<LoopHandle> {
        let running = self.running.lock().take();
        let ended = end_session(&self.state, &self.store);
        if let Some(profile) = ended {
            info!("Session for {} stopped", profile);
        }

        running.map(|r| {
            let _ = r.stop.send(true);
            LoopHandle::Task(r.handle)
        })
    }
}

/// Continuation for the lock gate: an expired session closes once unlocked.
fn close_after_unlock(state: Arc<Mutex<SessionState>>, store: Arc<PolicyStore>) -> Continuation {
    Box::new(move || {
        if let Some(profile) = end_session(&state, &store) {
            info!("Session for {} closed after unlock", profile);
        }
    })
}

/// Reset to Idle and clear the active profile. Returns the profile that was active.
fn end_session(state: &Mutex<SessionState>, store: &PolicyStore) -> Option<String> {
    let profile = {
        let mut state = state.lock();
        let profile = state.profile.take();
        *state = SessionState::idle();
        profile
    };

    if let Some(name) = &profile {
        if store.active_profile().as_deref() == Some(name.as_str()) {
            if let Err(e) = store.set_active_profile(None) {
                warn!("Failed to clear active profile: {}", e);
            }
        }
    }
    profile
}

async fn run_timer(
    state: Arc<Mutex<SessionState>>,
    store: Arc<PolicyStore>,
    gate: Arc<LockGate>,
    checkpoint: Arc<dyn Checkpoint>,
    notifier: Arc<dyn Notifier>,
    tick: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = time::interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        if *stop.borrow() {
            break;
        }

        match tick_once(&state, &store, checkpoint.as_ref()) {
            Tick::Continue => {}
            Tick::Ended => break,
            Tick::Expired { profile } => {
                if *stop.borrow() {
                    break;
                }
                info!("Time expired for {}", profile);
                let expected = store.gate_credential();
                let on_unlock = close_after_unlock(state.clone(), store.clone());
                if !gate.lock(LockReason::TimeExpired, expected, Some(on_unlock)) {
                    info!("Screen already locked; {}'s session closes when it unlocks", profile);
                }
                notifier.notify(Notification::TimeExpired { profile });
                break;
            }
        }
    }

    debug!("Session timer task exited");
}

fn tick_once(state: &Mutex<SessionState>, store: &PolicyStore, checkpoint: &dyn Checkpoint) -> Tick {
    // The state lock is not held across the checkpoint write.
    let (profile, used, charged, expired) = {
        let mut state = state.lock();
        if state.phase != TimerPhase::Running {
            return Tick::Ended;
        }
        let Some(profile) = state.profile.clone() else {
            return Tick::Ended;
        };

        state.remaining_seconds = state.remaining_seconds.saturating_sub(1);
        let used = state.used_minutes();

        let charged = match store.record_usage(&profile, used) {
            Ok(charged) => charged,
            Err(e) => {
                warn!("Ending session: {}", e);
                *state = SessionState::idle();
                return Tick::Ended;
            }
        };

        let expired = state.remaining_seconds == 0;
        if expired {
            state.phase = TimerPhase::Expired;
        }
        (profile, used, charged, expired)
    };

    if charged {
        debug!("{} has used {} minutes", profile, used);
        if let Err(e) = checkpoint.save(&store.content()) {
            error!("Failed to persist usage for {}: {:#}", profile, e);
        }
    }

    if expired {
        Tick::Expired { profile }
    } else {
        Tick::Continue
    }
}
