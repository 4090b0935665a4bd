//! Process start/end logging for the activity log.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::process::{ProcessInfo, ProcessTable};
use crate::lifecycle::{LoopHandle, StartOutcome};
use crate::policy::{LogEntry, LogKind, PolicyStore};

#[derive(Debug, Clone, PartialEq, Eq)]
struct SnapshotEntry {
    name: String,
    start_time: u64,
}

/// Processes seen on the previous tick, keyed by pid.
#[derive(Debug, Default, Clone)]
pub struct ProcessSnapshot {
    entries: HashMap<u32, SnapshotEntry>,
}

impl ProcessSnapshot {
    pub fn from_processes(processes: Vec<ProcessInfo>) -> Self {
        Self {
            entries: processes
                .into_iter()
                .map(|p| {
                    (
                        p.pid,
                        SnapshotEntry {
                            name: p.name,
                            start_time: p.start_time,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Log entries describing the change from `self` to `current`.
    ///
    /// A pid reused by a different process counts as an end followed by a start.
    pub fn diff(&self, current: &ProcessSnapshot, core: &CoreProcesses) -> Vec<LogEntry> {
        let mut entries = Vec::new();

        for (pid, old) in &self.entries {
            let replaced = current
                .entries
                .get(pid)
                .is_none_or(|new| new.start_time != old.start_time || new.name != old.name);
            if replaced && !core.contains(&old.name) {
                entries.push(LogEntry::now(LogKind::ProcessEnd, describe(*pid, &old.name)));
            }
        }

        for (pid, new) in &current.entries {
            let fresh = self
                .entries
                .get(pid)
                .is_none_or(|old| new.start_time != old.start_time || new.name != old.name);
            if fresh && !core.contains(&new.name) {
                entries.push(LogEntry::now(LogKind::ProcessStart, describe(*pid, &new.name)));
            }
        }

        entries
    }
}

fn describe(pid: u32, name: &str) -> String {
    format!("{} (pid {})", name, pid)
}

/// Operating-system processes that are never logged. Matching ignores case.
#[derive(Debug, Clone, Default)]
pub struct CoreProcesses(HashSet<String>);

impl CoreProcesses {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(names.into_iter().map(|n| n.as_ref().to_lowercase()).collect())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(&name.to_lowercase())
    }
}

struct RunningLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ActivityMonitor {
    table: Arc<dyn ProcessTable>,
    store: Arc<PolicyStore>,
    core: CoreProcesses,
    interval: Duration,
    max_log_entries: usize,
    runtime: Handle,
    running: Mutex<Option<RunningLoop>>,
}

impl ActivityMonitor {
    pub fn new(
        table: Arc<dyn ProcessTable>,
        store: Arc<PolicyStore>,
        core: CoreProcesses,
        interval: Duration,
        max_log_entries: usize,
        runtime: Handle,
    ) -> Self {
        Self {
            table,
            store,
            core,
            interval,
            max_log_entries,
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
            self.core.clone(),
            self.interval,
            self.max_log_entries,
            stop_rx,
        ));

        info!("Activity monitor started");
        *running = Some(RunningLoop { stop, handle });
        StartOutcome::Started
    }

    pub fn stop(&self) -> Option<LoopHandle> {
        let running = self.running.lock().take()?;
        let _ = running.stop.send(true);
        Some(LoopHandle::Task(running.handle))
    }
}

async fn run_loop(
    table: Arc<dyn ProcessTable>,
    store: Arc<PolicyStore>,
    core: CoreProcesses,
    interval: Duration,
    max_log_entries: usize,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // A listing that outlives this bound is abandoned for the tick.
    let list_bound = interval.max(Duration::from_secs(5));
    let mut previous: Option<ProcessSnapshot> = None;

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

        let tick_table = table.clone();
        let listing = tokio::task::spawn_blocking(move || tick_table.list_processes());
        let listed = tokio::select! {
            listed = time::timeout(list_bound, listing) => listed,
            _ = stop.changed() => break,
        };
        let current = match listed {
            Ok(Ok(processes)) => ProcessSnapshot::from_processes(processes),
            Ok(Err(e)) => {
                error!("Process listing failed: {}", e);
                continue;
            }
            Err(_) => {
                warn!("Process listing exceeded {:?}", list_bound);
                continue;
            }
        };

        // The first tick only records what is already running.
        if let Some(previous) = &previous {
            let entries = previous.diff(&current, &core);
            if !entries.is_empty() {
                debug!("Recording {} activity entries", entries.len());
                store.append_log(entries, max_log_entries);
            }
        }
        previous = Some(current);
    }

    info!("Activity monitor stopped");
}
