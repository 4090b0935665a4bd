//! In-memory collaborators for tests and local experiments.
//!
//! None of these touch the operating system.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::enforcement::intercept::{InterceptHandle, Interceptor, Received};
use crate::enforcement::process::{ProcessInfo, ProcessTable, TerminateError};
use crate::enforcement::resolver::Resolver;
use crate::error::{EngineError, EngineResult};
use crate::notify::{Notification, Notifier};
use crate::time_limits::pointer::PointerDevice;

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Build a minimal IPv4/TCP packet addressed to `dst`.
pub fn ipv4_packet(dst: Ipv4Addr) -> Vec<u8> {
    let total_length: u16 = 24;
    let mut pkt = vec![0u8; total_length as usize];
    // Version 4, IHL 5.
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&total_length.to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 6;
    pkt[12..16].copy_from_slice(&[192, 168, 1, 10]);
    pkt[16..20].copy_from_slice(&dst.octets());
    pkt[20..22].copy_from_slice(&50_000u16.to_be_bytes());
    pkt[22..24].copy_from_slice(&443u16.to_be_bytes());
    pkt
}

/// Build a minimal IPv6/TCP packet addressed to `dst`.
pub fn ipv6_packet(dst: Ipv6Addr) -> Vec<u8> {
    let payload_length: u16 = 4;
    let mut pkt = vec![0u8; 40 + payload_length as usize];
    pkt[0] = 0x60;
    pkt[4..6].copy_from_slice(&payload_length.to_be_bytes());
    pkt[6] = 6;
    pkt[7] = 64;
    pkt[24..40].copy_from_slice(&dst.octets());
    pkt[40..42].copy_from_slice(&50_000u16.to_be_bytes());
    pkt[42..44].copy_from_slice(&443u16.to_be_bytes());
    pkt
}

/// Resolver answering from a fixed table; unknown names fail.
#[derive(Debug, Default)]
pub struct MockResolver {
    answers: Mutex<HashMap<String, BTreeSet<IpAddr>>>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, domain: &str, ips: &[IpAddr]) {
        self.answers
            .lock()
            .insert(domain.to_string(), ips.iter().copied().collect());
    }

    pub fn remove(&self, domain: &str) {
        self.answers.lock().remove(domain);
    }
}

impl Resolver for MockResolver {
    fn resolve_host(&self, domain: &str) -> EngineResult<BTreeSet<IpAddr>> {
        self.answers
            .lock()
            .get(domain)
            .cloned()
            .ok_or_else(|| EngineError::Resolution {
                domain: domain.to_string(),
                reason: "no such host".into(),
            })
    }
}

/// Process table holding fake processes.
#[derive(Debug, Default)]
pub struct MockProcessTable {
    processes: Mutex<BTreeMap<u32, ProcessInfo>>,
    denied: Mutex<HashSet<u32>>,
    terminated: Mutex<Vec<u32>>,
    list_delay: Mutex<Duration>,
    terminate_delay: Mutex<Duration>,
}

impl MockProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&self, pid: u32, name: &str) {
        self.processes.lock().insert(
            pid,
            ProcessInfo {
                pid,
                name: name.to_string(),
                start_time: u64::from(pid),
            },
        );
    }

    /// Simulate a process exiting on its own.
    pub fn exit(&self, pid: u32) {
        self.processes.lock().remove(&pid);
    }

    /// Make termination of `pid` fail with access denied.
    pub fn deny_termination(&self, pid: u32) {
        self.denied.lock().insert(pid);
    }

    /// Make every listing take `delay` first.
    pub fn stall_listing(&self, delay: Duration) {
        *self.list_delay.lock() = delay;
    }

    /// Make every termination take `delay` first.
    pub fn stall_termination(&self, delay: Duration) {
        *self.terminate_delay.lock() = delay;
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.processes.lock().contains_key(&pid)
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().clone()
    }
}

impl ProcessTable for MockProcessTable {
    fn list_processes(&self) -> Vec<ProcessInfo> {
        let delay = *self.list_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.processes.lock().values().cloned().collect()
    }

    fn terminate(&self, pid: u32) -> Result<(), TerminateError> {
        let delay = *self.terminate_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.denied.lock().contains(&pid) {
            return Err(TerminateError::AccessDenied(format!("pid {pid} is protected")));
        }
        match self.processes.lock().remove(&pid) {
            Some(_) => {
                self.terminated.lock().push(pid);
                Ok(())
            }
            None => Err(TerminateError::NotFound),
        }
    }
}

/// Interceptor fed by [`inject`](MockInterceptor::inject).
///
/// The packet queue survives close/reopen so a filter can be restarted.
pub struct MockInterceptor {
    inbound: Sender<Vec<u8>>,
    queue: Arc<Mutex<Option<Receiver<Vec<u8>>>>>,
    forwarded: Arc<Mutex<Vec<Vec<u8>>>>,
    received: Arc<AtomicUsize>,
    fail_open: AtomicBool,
    fail_recv: Arc<AtomicBool>,
}

impl MockInterceptor {
    pub fn new() -> Self {
        let (inbound, queue) = mpsc::channel();
        Self {
            inbound,
            queue: Arc::new(Mutex::new(Some(queue))),
            forwarded: Arc::new(Mutex::new(Vec::new())),
            received: Arc::new(AtomicUsize::new(0)),
            fail_open: AtomicBool::new(false),
            fail_recv: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn inject(&self, packet: Vec<u8>) {
        let _ = self.inbound.send(packet);
    }

    /// Packets handed to the filter so far.
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    /// Packets the filter re-injected, in order.
    pub fn forwarded(&self) -> Vec<Vec<u8>> {
        self.forwarded.lock().clone()
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make the next receive report a driver error.
    pub fn fail_next_recv(&self) {
        self.fail_recv.store(true, Ordering::SeqCst);
    }
}

impl Default for MockInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MockHandle {
    queue: Option<Receiver<Vec<u8>>>,
    slot: Arc<Mutex<Option<Receiver<Vec<u8>>>>>,
    forwarded: Arc<Mutex<Vec<Vec<u8>>>>,
    received: Arc<AtomicUsize>,
    fail_recv: Arc<AtomicBool>,
}

impl InterceptHandle for MockHandle {
    type Packet = Vec<u8>;

    fn recv(&mut self, timeout: Duration) -> EngineResult<Received<Vec<u8>>> {
        if self.fail_recv.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Interception("mock driver failure".into()));
        }
        let Some(queue) = self.queue.as_ref() else {
            return Ok(Received::Closed);
        };
        match queue.recv_timeout(timeout) {
            Ok(packet) => {
                self.received.fetch_add(1, Ordering::SeqCst);
                Ok(Received::Packet(packet))
            }
            Err(RecvTimeoutError::Timeout) => Ok(Received::Timeout),
            Err(RecvTimeoutError::Disconnected) => Ok(Received::Closed),
        }
    }

    fn forward(&mut self, packet: Vec<u8>) -> EngineResult<()> {
        self.forwarded.lock().push(packet);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(queue) = self.queue.take() {
            *self.slot.lock() = Some(queue);
        }
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl Interceptor for MockInterceptor {
    type Handle = MockHandle;

    fn open(&self, _filter: &str) -> EngineResult<MockHandle> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(EngineError::Interception("mock driver unavailable".into()));
        }
        let queue = self
            .queue
            .lock()
            .take()
            .ok_or_else(|| EngineError::Interception("mock handle already open".into()))?;
        Ok(MockHandle {
            queue: Some(queue),
            slot: self.queue.clone(),
            forwarded: self.forwarded.clone(),
            received: self.received.clone(),
            fail_recv: self.fail_recv.clone(),
        })
    }
}

/// Pointer with a settable position that records moves.
#[derive(Debug)]
pub struct MockPointer {
    position: Mutex<(i32, i32)>,
    moves: AtomicUsize,
}

impl MockPointer {
    pub fn new(x: i32, y: i32) -> Self {
        Self {
            position: Mutex::new((x, y)),
            moves: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, x: i32, y: i32) {
        *self.position.lock() = (x, y);
    }

    pub fn current(&self) -> (i32, i32) {
        *self.position.lock()
    }

    pub fn moves(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }
}

impl PointerDevice for MockPointer {
    fn position(&self) -> Option<(i32, i32)> {
        Some(self.current())
    }

    fn move_to(&self, x: i32, y: i32) {
        self.moves.fetch_add(1, Ordering::SeqCst);
        self.set(x, y);
    }
}

/// Notifier that keeps every notification.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.sent.lock().push(notification);
    }
}
