//! Credential-gated lock state with pointer confinement.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::pointer::{PointerDevice, Region};
use crate::error::{EngineError, EngineResult};
use crate::lifecycle::StopSignal;
use crate::policy::Credential;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Open,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReason {
    TimeExpired,
    Administrative,
}

impl fmt::Display for LockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockReason::TimeExpired => f.write_str("time expired"),
            LockReason::Administrative => f.write_str("administrative lock"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockOutcome {
    Unlocked,
    NotLocked,
}

/// Runs once after a successful unlock.
pub type Continuation = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy)]
pub struct GateSettings {
    pub region: Region,
    pub poll_interval: Duration,
    pub join_timeout: Duration,
}

/// Background thread that keeps the cursor inside the lock region.
struct Confiner {
    stop: Arc<StopSignal>,
    done: mpsc::Receiver<()>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Confiner {
    fn spawn(pointer: Arc<dyn PointerDevice>, settings: GateSettings) -> std::io::Result<Self> {
        let stop = Arc::new(StopSignal::new());
        let (done_tx, done) = mpsc::channel();
        let thread_stop = stop.clone();

        let thread = std::thread::Builder::new()
            .name("pointer-confiner".into())
            .spawn(move || {
                loop {
                    if let Some((x, y)) = pointer.position() {
                        let (cx, cy) = settings.region.clamp(x, y);
                        if (cx, cy) != (x, y) {
                            pointer.move_to(cx, cy);
                        }
                    }
                    if thread_stop.wait_timeout(settings.poll_interval) {
                        break;
                    }
                }
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            stop,
            done,
            thread: Some(thread),
        })
    }

    /// Stop the thread and wait up to `timeout` for it. Returns `true` if it exited.
    fn release(mut self, timeout: Duration) -> bool {
        self.stop.trigger();
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(thread) = self.thread.take() {
                    if thread.join().is_err() {
                        error!("Pointer confinement thread panicked");
                    }
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Pointer confinement did not stop within {:?}", timeout);
                false
            }
        }
    }
}

struct GateInner {
    state: GateState,
    reason: Option<LockReason>,
    expected: Credential,
    locked_at: Option<DateTime<Utc>>,
    confiner: Option<Confiner>,
    on_unlock: Option<Continuation>,
}

pub struct LockGate {
    pointer: Arc<dyn PointerDevice>,
    settings: GateSettings,
    inner: Mutex<GateInner>,
}

impl LockGate {
    pub fn new(pointer: Arc<dyn PointerDevice>, settings: GateSettings) -> Self {
        Self {
            pointer,
            settings,
            inner: Mutex::new(GateInner {
                state: GateState::Open,
                reason: None,
                expected: Credential::default(),
                locked_at: None,
                confiner: None,
                on_unlock: None,
            }),
        }
    }

    pub fn state(&self) -> GateState {
        self.inner.lock().state
    }

    pub fn is_locked(&self) -> bool {
        self.state() == GateState::Locked
    }

    pub fn reason(&self) -> Option<LockReason> {
        self.inner.lock().reason
    }

    pub fn locked_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().locked_at
    }

    /// Enter the locked state. Returns `false` if the gate was already locked.
    ///
    /// A lock that lands on an existing one keeps the existing credential,
    /// runs its continuation after the existing one, and an expiry takes
    /// over the reason.
    pub fn lock(
        &self,
        reason: LockReason,
        expected: Credential,
        on_unlock: Option<Continuation>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == GateState::Locked {
            debug!("Gate already locked ({:?}), joining {:?}", inner.reason, reason);
            if let Some(next) = on_unlock {
                let chained: Continuation = match inner.on_unlock.take() {
                    Some(first) => Box::new(move || {
                        first();
                        next();
                    }),
                    None => next,
                };
                inner.on_unlock = Some(chained);
            }
            if reason == LockReason::TimeExpired {
                inner.reason = Some(reason);
            }
            return false;
        }

        let confiner = match Confiner::spawn(self.pointer.clone(), self.settings) {
            Ok(confiner) => Some(confiner),
            Err(e) => {
                error!("Failed to start pointer confinement: {}", e);
                None
            }
        };

        inner.state = GateState::Locked;
        inner.reason = Some(reason);
        inner.expected = expected;
        inner.locked_at = Some(Utc::now());
        inner.confiner = confiner;
        inner.on_unlock = on_unlock;
        info!("Screen locked: {}", reason);
        true
    }

    /// Leave the locked state if `attempt` matches the expected credential.
    ///
    /// A mismatch leaves the gate locked. The continuation runs after the
    /// gate is open and outside its lock.
    pub fn unlock(&self, attempt: &str) -> EngineResult<UnlockOutcome> {
        let (confiner, continuation) = {
            let mut inner = self.inner.lock();
            if inner.state == GateState::Open {
                return Ok(UnlockOutcome::NotLocked);
            }
            if !inner.expected.matches(attempt) {
                warn!("Unlock attempt with wrong credential");
                return Err(EngineError::CredentialMismatch);
            }

            inner.state = GateState::Open;
            inner.reason = None;
            inner.locked_at = None;
            inner.expected = Credential::default();
            (inner.confiner.take(), inner.on_unlock.take())
        };

        if let Some(confiner) = confiner {
            confiner.release(self.settings.join_timeout);
        }
        info!("Screen unlocked");

        if let Some(continuation) = continuation {
            continuation();
        }
        Ok(UnlockOutcome::Unlocked)
    }
}

impl Drop for LockGate {
    fn drop(&mut self) {
        if let Some(confiner) = self.inner.get_mut().confiner.take() {
            confiner.release(self.settings.join_timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{wait_until, MockPointer};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn make_test_gate(pointer: Arc<MockPointer>) -> LockGate {
        LockGate::new(
            pointer,
            GateSettings {
                region: Region {
                    x: 0,
                    y: 0,
                    width: 800,
                    height: 600,
                },
                poll_interval: Duration::from_millis(5),
                join_timeout: Duration::from_millis(500),
            },
        )
    }

    #[test]
    fn opens_only_on_matching_credential() {
        let gate = make_test_gate(Arc::new(MockPointer::new(10, 10)));
        assert!(gate.lock(LockReason::Administrative, Credential::new("1234"), None));
        assert!(gate.is_locked());

        let err = gate.unlock("0000").unwrap_err();
        assert_eq!(err.kind(), "CredentialMismatch");
        assert!(gate.is_locked());

        assert_eq!(gate.unlock("1234").unwrap(), UnlockOutcome::Unlocked);
        assert_eq!(gate.state(), GateState::Open);
        assert_eq!(gate.unlock("1234").unwrap(), UnlockOutcome::NotLocked);
    }

    #[test]
    fn second_lock_is_ignored() {
        let gate = make_test_gate(Arc::new(MockPointer::new(10, 10)));
        assert!(gate.lock(LockReason::TimeExpired, Credential::new("a"), None));
        assert!(!gate.lock(LockReason::Administrative, Credential::new("b"), None));
        assert_eq!(gate.reason(), Some(LockReason::TimeExpired));
        assert!(gate.unlock("b").is_err());
        gate.unlock("a").unwrap();
    }

    #[test]
    fn expiry_joins_an_existing_lock() {
        let gate = make_test_gate(Arc::new(MockPointer::new(10, 10)));
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        assert!(gate.lock(LockReason::Administrative, Credential::new("pw"), None));
        assert!(!gate.lock(
            LockReason::TimeExpired,
            Credential::new("other"),
            Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
        ));
        assert_eq!(gate.reason(), Some(LockReason::TimeExpired));

        assert!(gate.unlock("other").is_err());
        gate.unlock("pw").unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn chained_continuations_run_in_lock_order() {
        let gate = make_test_gate(Arc::new(MockPointer::new(10, 10)));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (first, second) = (order.clone(), order.clone());

        gate.lock(
            LockReason::TimeExpired,
            Credential::new("pw"),
            Some(Box::new(move || first.lock().push(1))),
        );
        gate.lock(
            LockReason::TimeExpired,
            Credential::new("pw"),
            Some(Box::new(move || second.lock().push(2))),
        );
        gate.unlock("pw").unwrap();
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn continuation_runs_after_unlock() {
        let gate = make_test_gate(Arc::new(MockPointer::new(10, 10)));
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        gate.lock(
            LockReason::TimeExpired,
            Credential::new("pw"),
            Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
        );
        let _ = gate.unlock("nope");
        assert!(!ran.load(Ordering::SeqCst));

        gate.unlock("pw").unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn confines_pointer_while_locked() {
        let pointer = Arc::new(MockPointer::new(2000, 50));
        let gate = make_test_gate(pointer.clone());
        gate.lock(LockReason::Administrative, Credential::new("pw"), None);

        assert!(wait_until(Duration::from_secs(2), || pointer.current() == (799, 50)));
        assert!(pointer.moves() >= 1);

        gate.unlock("pw").unwrap();
        let moves = pointer.moves();
        pointer.set(3000, 3000);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(pointer.current(), (3000, 3000));
        assert_eq!(pointer.moves(), moves);
    }
}
