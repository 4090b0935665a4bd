//! Periodic termination of blocked applications.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::process::{ProcessInfo, ProcessTable, TerminateError};
use crate::lifecycle::{LoopHandle, StartOutcome};
use crate::notify::{Notification, Notifier};
use crate::policy::PolicyStore;

/// What one enforcement pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnforcementReport {
    pub terminated: Vec<ProcessInfo>,
    /// Matches that exited first or could not be killed.
    pub skipped: usize,
}

/// Kill every process whose name is exactly in `blocked`.
pub fn enforce_once(table: &dyn ProcessTable, blocked: &BTreeSet<String>) -> EnforcementReport {
    let mut report = EnforcementReport::default();
    if blocked.is_empty() {
        return report;
    }

    for process in table.list_processes() {
        if !blocked.contains(&process.name) {
            continue;
        }

        match table.terminate(process.pid) {
            Ok(()) => {
                info!("Terminated blocked application {} (pid {})", process.name, process.pid);
                report.terminated.push(process);
            }
            Err(TerminateError::NotFound) => {
                debug!("{} (pid {}) exited before termination", process.name, process.pid);
                report.skipped += 1;
            }
            Err(e) => {
                debug!("{}", e.into_engine_error(process.pid));
                report.skipped += 1;
            }
        }
    }

    report
}

struct RunningLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ProcessEnforcer {
    table: Arc<dyn ProcessTable>,
    store: Arc<PolicyStore>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    runtime: Handle,
    running: Mutex<Option<RunningLoop>>,
}

impl ProcessEnforcer {
    pub fn new(
        table: Arc<dyn ProcessTable>,
        store: Arc<PolicyStore>,
        notifier: Arc<dyn Notifier>,
        interval: Duration,
        runtime: Handle,
    ) -> Self {
        Self {
            table,
            store,
            notifier,
            interval,
            runtime,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    pub fn start(&self) -> StartOutcome {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return StartOutcome::AlreadyRunning;
        }

        let (stop, stop_rx) = watch::channel(false);
        let handle = self.runtime.spawn(run_loop(
            self.table.clone(),
            self.store.clone(),
            self.notifier.clone(),
            self.interval,
            stop_rx,
        ));

        info!("Application blocking started (every {:?})", self.interval);
        *running = Some(RunningLoop { stop, handle });
        StartOutcome::Started
    }

    /// Signal the loop to stop. The returned handle resolves once it has exited.
    pub fn stop(&self) -> Option<LoopHandle> {
        let running = self.running.lock().take()?;
        let _ = running.stop.send(true);
        info!("Application blocking stopping");
        Some(LoopHandle::Task(running.handle))
    }
}

async fn run_loop(
    table: Arc<dyn ProcessTable>,
    store: Arc<PolicyStore>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // A pass that outlives this bound keeps running on its blocking thread but is no longer awaited.
    let cycle_bound = interval.max(Duration::from_secs(5));

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

        let blocked = store.snapshot().apps;
        if blocked.is_empty() {
            continue;
        }

        let cycle_table = table.clone();
        let cycle = tokio::task::spawn_blocking(move || enforce_once(&*cycle_table, &blocked));

        let finished = tokio::select! {
            finished = time::timeout(cycle_bound, cycle) => finished,
            _ = stop.changed() => break,
        };

        match finished {
            Ok(Ok(report)) => {
                for process in report.terminated {
                    notifier.notify(Notification::AppTerminated {
                        name: process.name,
                        pid: process.pid,
                    });
                }
            }
            Ok(Err(e)) => error!("Application blocking pass failed: {}", e),
            Err(_) => warn!("Application blocking pass exceeded {:?}", cycle_bound),
        }
    }

    info!("Application blocking stopped");
}
