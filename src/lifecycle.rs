//! Start/stop plumbing shared by the background loops.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

/// Result of asking a loop to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// Cooperative stop flag for OS threads with an interruptible sleep.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let mut stopped = self.stopped.lock();
        *stopped = true;
        self.wake.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep for up to `timeout`, returning early once triggered.
    ///
    /// Returns `true` if the signal has been triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.wake.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

/// Handle to a stopped (or stopping) loop that can be awaited.
#[derive(Debug)]
pub enum LoopHandle {
    Thread(std::thread::JoinHandle<()>),
    Task(tokio::task::JoinHandle<()>),
}

impl LoopHandle {
    /// Wait for the loop to exit, giving up after `bound`.
    ///
    /// Returns `true` if the loop exited in time.
    pub async fn wait(self, name: &str, bound: Duration) -> bool {
        let joined = match self {
            LoopHandle::Thread(handle) => {
                let join = tokio::task::spawn_blocking(move || handle.join().is_ok());
                tokio::time::timeout(bound, join).await.map(|r| matches!(r, Ok(true)))
            }
            LoopHandle::Task(handle) => tokio::time::timeout(bound, handle)
                .await
                .map(|r| r.is_ok()),
        };

        match joined {
            Ok(clean) => {
                if !clean {
                    warn!("{} exited abnormally", name);
                }
                true
            }
            Err(_) => {
                warn!("{} did not stop within {:?}", name, bound);
                false
            }
        }
    }
}
