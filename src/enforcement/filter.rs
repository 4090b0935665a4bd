//! Outbound packet filtering against the resolved site block list.
//!
//! Two OS threads per run: the packet loop owns the interception handle
//! and never blocks on DNS; the refresh loop re-resolves blocked domains
//! when the policy generation changes or the refresh period elapses and
//! hands each new table to the packet loop.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::intercept::{InterceptHandle, Interceptor, Received};
use super::packet;
use super::resolver::{BlockTable, DomainResolver};
use crate::error::{EngineError, EngineResult};
use crate::lifecycle::{LoopHandle, StartOutcome, StopSignal};
use crate::policy::{LogEntry, LogKind, PolicyStore};

/// How often the refresh loop looks for policy changes.
const POLICY_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    Idle,
    Filtering,
}

#[derive(Debug, Clone)]
pub struct FilterSettings {
    /// Driver filter expression selecting the packets to intercept.
    pub filter: String,
    pub refresh: Duration,
    pub recv_timeout: Duration,
    pub max_log_entries: usize,
}

/// Type-erased control surface so the engine does not carry the interceptor type.
pub trait FilterControl: Send + Sync {
    fn start(&self) -> EngineResult<StartOutcome>;

    fn stop(&self) -> Option<LoopHandle>;

    fn state(&self) -> FilterState;
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict<'a> {
    Forward,
    DropAll,
    Drop(&'a str),
}

fn verdict<'a>(kill_switch: bool, table: &'a BlockTable, data: &[u8]) -> Verdict<'a> {
    if kill_switch {
        return Verdict::DropAll;
    }
    match packet::destination(data).and_then(|ip| table.domain_for(&ip)) {
        Some(domain) => Verdict::Drop(domain),
        None => Verdict::Forward,
    }
}

struct Run {
    stop: Arc<StopSignal>,
    thread: std::thread::JoinHandle<()>,
}

pub struct PacketFilterEngine<I: Interceptor> {
    interceptor: Arc<I>,
    store: Arc<PolicyStore>,
    resolver: Arc<DomainResolver>,
    settings: FilterSettings,
    active: Arc<AtomicBool>,
    run: Mutex<Option<Run>>,
}

impl<I: Interceptor> PacketFilterEngine<I> {
    pub fn new(
        interceptor: Arc<I>,
        store: Arc<PolicyStore>,
        resolver: Arc<DomainResolver>,
        settings: FilterSettings,
    ) -> Self {
        Self {
            interceptor,
            store,
            resolver,
            settings,
            active: Arc::new(AtomicBool::new(false)),
            run: Mutex::new(None),
        }
    }

    fn launch(&self) -> EngineResult<Run> {
        // Resolve before the handle exists so our own lookups are not intercepted.
        let snapshot = self.store.snapshot();
        let table = self.resolver.refresh(&self.store, &snapshot.sites);
        info!(
            "Blocking {} sites ({} addresses, {} unresolved)",
            snapshot.sites.len(),
            table.len(),
            table.unresolved().len()
        );

        let handle = self.interceptor.open(&self.settings.filter)?;
        let stop = Arc::new(StopSignal::new());
        let (tables_tx, tables_rx) = mpsc::channel();

        let refresh = RefreshLoop {
            store: self.store.clone(),
            resolver: self.resolver.clone(),
            period: self.settings.refresh,
            last_generation: snapshot.generation,
            tables: tables_tx,
            stop: stop.clone(),
        };
        let packets = PacketLoop {
            store: self.store.clone(),
            settings: self.settings.clone(),
            table,
            tables: tables_rx,
            stop: stop.clone(),
        };
        let active = self.active.clone();

        let thread = std::thread::Builder::new()
            .name("packet-filter".into())
            .spawn(move || {
                let refresher = std::thread::Builder::new()
                    .name("blocklist-refresh".into())
                    .spawn(move || refresh.run());

                match packets.run(handle) {
                    Ok(stats) => info!(
                        "Packet filter stopped ({} forwarded, {} dropped)",
                        stats.forwarded, stats.dropped
                    ),
                    Err(e) => error!("Packet filter loop exited: {:#}", e),
                }

                match refresher {
                    Ok(refresher) => {
                        if refresher.join().is_err() {
                            error!("Block list refresh thread panicked");
                        }
                    }
                    Err(e) => error!("Failed to spawn block list refresh thread: {}", e),
                }
                active.store(false, Ordering::Release);
            });

        match thread {
            Ok(thread) => Ok(Run { stop, thread }),
            Err(e) => Err(EngineError::Interception(format!(
                "failed to spawn packet filter thread: {e}"
            ))),
        }
    }
}

impl<I: Interceptor> FilterControl for PacketFilterEngine<I> {
    fn start(&self) -> EngineResult<StartOutcome> {
        let mut run = self.run.lock();
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(StartOutcome::AlreadyRunning);
        }

        match self.launch() {
            Ok(started) => {
                *run = Some(started);
                info!("Packet filter started with filter: {}", self.settings.filter);
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                error!("Packet filter failed to start: {}", e);
                self.active.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn stop(&self) -> Option<LoopHandle> {
        let run = self.run.lock().take()?;
        run.stop.trigger();
        info!("Packet filter stopping");
        Some(LoopHandle::Thread(run.thread))
    }

    fn state(&self) -> FilterState {
        if self.active.load(Ordering::Acquire) {
            FilterState::Filtering
        } else {
            FilterState::Idle
        }
    }
}

#[derive(Debug, Default)]
struct FilterStats {
    forwarded: u64,
    dropped: u64,
}

struct PacketLoop {
    store: Arc<PolicyStore>,
    settings: FilterSettings,
    table: BlockTable,
    tables: Receiver<BlockTable>,
    stop: Arc<StopSignal>,
}

impl PacketLoop {
    fn run<H: InterceptHandle>(mut self, mut handle: H) -> EngineResult<FilterStats> {
        let result = self.pump(&mut handle);
        handle.close();
        // Also wakes the refresh loop when the packet loop exits on its own.
        self.stop.trigger();
        result
    }

    fn pump<H: InterceptHandle>(&mut self, handle: &mut H) -> EngineResult<FilterStats> {
        let mut stats = FilterStats::default();
        let mut reported: HashSet<String> = HashSet::new();

        while !self.stop.is_triggered() {
            // Each new table starts a new cycle.
            while let Ok(table) = self.tables.try_recv() {
                debug!("Block list refreshed: {} addresses", table.len());
                self.table = table;
                reported.clear();
            }

            let packet = match handle.recv(self.settings.recv_timeout)? {
                Received::Packet(packet) => packet,
                Received::Timeout => continue,
                Received::Closed => {
                    info!("Interception handle closed");
                    break;
                }
            };

            match verdict(self.store.kill_switch(), &self.table, packet.as_ref()) {
                Verdict::Forward => {
                    if let Err(e) = handle.forward(packet) {
                        warn!("{}", e);
                    } else {
                        stats.forwarded += 1;
                    }
                }
                Verdict::DropAll => stats.dropped += 1,
                Verdict::Drop(domain) => {
                    stats.dropped += 1;
                    if !reported.contains(domain) {
                        debug!("Dropped traffic to blocked site {}", domain);
                        reported.insert(domain.to_string());
                        self.store.append_log(
                            vec![LogEntry::now(LogKind::SiteVisit, domain)],
                            self.settings.max_log_entries,
                        );
                    }
                }
            }
        }

        Ok(stats)
    }
}

struct RefreshLoop {
    store: Arc<PolicyStore>,
    resolver: Arc<DomainResolver>,
    period: Duration,
    last_generation: u64,
    tables: Sender<BlockTable>,
    stop: Arc<StopSignal>,
}

impl RefreshLoop {
    fn run(mut self) {
        let mut last_refresh = Instant::now();

        while !self.stop.wait_timeout(POLICY_POLL) {
            let changed = self.store.generation() != self.last_generation;
            if !changed && last_refresh.elapsed() < self.period {
                continue;
            }

            let snapshot = self.store.snapshot();
            let table = self.resolver.refresh(&self.store, &snapshot.sites);
            self.last_generation = snapshot.generation;
            last_refresh = Instant::now();

            if self.tables.send(table).is_err() {
                break;
            }
        }
    }
}
