/// Screen-time enforcement
///
/// This module provides:
/// - a per-session countdown charging each profile's daily budget
/// - a credential-gated lock that holds the cursor while time is up
/// - pointer device access for the lock

pub mod gate;
pub mod pointer;
pub mod timer;

pub use gate::{Continuation, GateSettings, GateState, LockGate, LockReason, UnlockOutcome};
pub use pointer::{NoPointer, PointerDevice, Region, platform_pointer};
pub use timer::{SessionStatus, SessionTimer, TimerPhase};
