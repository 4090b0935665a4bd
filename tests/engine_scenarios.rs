use assert_fs::prelude::*;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use family_guard::config::EngineConfig;
use family_guard::engine::{Collaborators, Engine};
use family_guard::enforcement::FilterState;
use family_guard::lifecycle::StartOutcome;
use family_guard::mock::{
    MockInterceptor, MockPointer, MockProcessTable, MockResolver, RecordingNotifier, ipv4_packet,
    wait_until,
};
use family_guard::policy::{Change, Credential, LogKind, Profile, StoreContent};
use family_guard::state::{Checkpoint, MemoryCheckpoint, StateFile, load_state, today};
use family_guard::time_limits::{GateState, LockReason, TimerPhase, UnlockOutcome};

const BLOCKED_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const ALLOWED_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

struct Harness {
    engine: Engine,
    interceptor: Arc<MockInterceptor>,
    resolver: Arc<MockResolver>,
    processes: Arc<MockProcessTable>,
    checkpoint: Arc<MemoryCheckpoint>,
}

fn make_test_content() -> StoreContent {
    StoreContent {
        admin_credential: Credential::new("admin-pw"),
        profiles: vec![Profile::new("kid", 9, Credential::new("kid-pw"), 1)],
        usage_date: today(),
        ..Default::default()
    }
}

fn make_harness() -> Harness {
    let interceptor = Arc::new(MockInterceptor::new());
    let resolver = Arc::new(MockResolver::new());
    let processes = Arc::new(MockProcessTable::new());
    let checkpoint = Arc::new(MemoryCheckpoint::new());

    let engine = Engine::new(
        &EngineConfig::default(),
        make_test_content(),
        Collaborators {
            interceptor: interceptor.clone(),
            resolver: resolver.clone(),
            processes: processes.clone(),
            activity_processes: processes.clone(),
            pointer: Arc::new(MockPointer::new(2000, 2000)),
            notifier: Arc::new(RecordingNotifier::new()),
            checkpoint: checkpoint.clone(),
        },
        Handle::current(),
    );

    Harness {
        engine,
        interceptor,
        resolver,
        processes,
        checkpoint,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocked_site_packets_are_dropped_and_others_forwarded() {
    let h = make_harness();
    h.resolver.insert("blocked.test", &[IpAddr::V4(BLOCKED_IP)]);

    assert_eq!(
        h.engine.add_site(None, "https://blocked.test/page").unwrap(),
        Change::Added
    );
    assert_eq!(h.engine.start_blocking().unwrap(), StartOutcome::Started);
    assert_eq!(h.engine.start_blocking().unwrap(), StartOutcome::AlreadyRunning);

    h.interceptor.inject(ipv4_packet(BLOCKED_IP));
    h.interceptor.inject(ipv4_packet(ALLOWED_IP));
    assert!(wait_until(Duration::from_secs(3), || {
        h.interceptor.received() == 2 && h.interceptor.forwarded().len() == 1
    }));
    assert_eq!(h.interceptor.forwarded(), vec![ipv4_packet(ALLOWED_IP)]);

    let visits: Vec<_> = h
        .engine
        .store()
        .machine_log()
        .into_iter()
        .filter(|e| e.kind == LogKind::SiteVisit)
        .collect();
    assert_eq!(visits.len(), 1);
    assert_eq!(visits[0].subject, "blocked.test");

    assert!(h.engine.stop_blocking().await);
    assert_eq!(h.engine.status().filter, FilterState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_switch_drops_everything() {
    let h = make_harness();
    assert!(!h.engine.set_kill_switch(true).unwrap());
    assert_eq!(h.engine.status().filter, FilterState::Filtering);

    h.interceptor.inject(ipv4_packet(ALLOWED_IP));
    assert!(wait_until(Duration::from_secs(3), || h.interceptor.received() == 1));
    std::thread::sleep(Duration::from_millis(50));
    assert!(h.interceptor.forwarded().is_empty());

    assert!(h.engine.set_kill_switch(false).unwrap());
    h.interceptor.inject(ipv4_packet(ALLOWED_IP));
    assert!(wait_until(Duration::from_secs(3), || {
        h.interceptor.forwarded().len() == 1
    }));

    h.engine.shutdown().await.unwrap();
    assert!(!h.checkpoint.last().unwrap().internet_disabled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unresolvable_site_is_kept_but_blocks_nothing() {
    let h = make_harness();
    assert_eq!(h.engine.add_site(None, "example.com").unwrap(), Change::Added);
    h.engine.start_blocking().unwrap();

    h.interceptor.inject(ipv4_packet(BLOCKED_IP));
    assert!(wait_until(Duration::from_secs(3), || {
        h.interceptor.forwarded().len() == 1
    }));

    assert!(h.engine.store().snapshot().sites.contains("example.com"));
    assert_eq!(
        h.engine.store().resolved("example.com").unwrap_or_default().len(),
        0
    );
    h.engine.stop_blocking().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocked_app_is_terminated_by_exact_name() {
    let h = make_harness();
    h.processes.spawn(100, "calc.exe");
    h.processes.spawn(101, "calc.exe.bak");
    h.processes.spawn(102, "notepad.exe");

    h.engine.add_app(None, "calc.exe").unwrap();
    assert_eq!(h.engine.start_app_blocking(), StartOutcome::Started);

    assert!(wait_until(Duration::from_secs(3), || !h.processes.is_alive(100)));
    assert!(h.processes.is_alive(101));
    assert!(h.processes.is_alive(102));
    assert_eq!(h.processes.terminated(), vec![100]);

    assert!(h.engine.stop_app_blocking().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn activity_monitor_logs_new_processes() {
    let h = make_harness();
    h.processes.spawn(1, "svchost.exe");
    h.engine.start_monitoring();

    // Let the first tick seed the snapshot.
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.processes.spawn(200, "game.exe");
    h.processes.spawn(201, "csrss.exe");

    assert!(wait_until(Duration::from_secs(4), || {
        h.engine
            .store()
            .machine_log()
            .iter()
            .any(|e| e.kind == LogKind::ProcessStart && e.subject.contains("game.exe"))
    }));
    assert!(!h
        .engine
        .store()
        .machine_log()
        .iter()
        .any(|e| e.subject.contains("csrss.exe")));

    h.engine.stop_monitoring().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_allowance_locks_until_profile_credential() {
    let h = make_harness();
    assert_eq!(h.engine.start_session("kid").unwrap(), 60);

    tokio::time::sleep(Duration::from_millis(61_500)).await;

    let status = h.engine.status();
    assert_eq!(status.session.phase, TimerPhase::Expired);
    assert_eq!(status.gate, GateState::Locked);
    assert_eq!(status.lock_reason, Some(LockReason::TimeExpired));
    assert_eq!(h.engine.store().profile("kid").unwrap().used_minutes, 1);

    assert!(!h.engine.verify_credential("kid", "admin-pw").unwrap());
    assert!(h.engine.unlock("admin-pw").is_err());
    assert!(h.engine.is_locked());

    assert!(h.engine.verify_credential("kid", "kid-pw").unwrap());
    assert_eq!(h.engine.unlock("kid-pw").unwrap(), UnlockOutcome::Unlocked);
    assert_eq!(h.engine.session().phase, TimerPhase::Idle);
    assert_eq!(h.engine.status().active_profile, None);

    assert_eq!(h.checkpoint.last().unwrap().profiles[0].used_minutes, 1);
    assert_eq!(h.engine.query_remaining_time("kid").unwrap(), 0);
    assert_eq!(
        h.engine.start_session("kid").unwrap_err().kind(),
        "SessionRejected"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn activity_is_logged_while_a_termination_stalls() {
    let h = make_harness();
    h.processes.spawn(100, "calc.exe");
    h.processes.stall_termination(Duration::from_secs(3));
    h.engine.add_app(None, "calc.exe").unwrap();

    h.engine.start_app_blocking();
    h.engine.start_monitoring();
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.processes.spawn(200, "game.exe");

    assert!(wait_until(Duration::from_secs(2), || {
        h.engine
            .store()
            .machine_log()
            .iter()
            .any(|e| e.kind == LogKind::ProcessStart && e.subject == "game.exe (pid 200)")
    }));
    assert!(h.processes.terminated().is_empty());

    h.engine.stop_monitoring().await;
    h.engine.stop_app_blocking().await;
}

#[tokio::test(start_paused = true)]
async fn expiry_during_a_manual_lock_ends_the_session_on_unlock() {
    let h = make_harness();
    h.engine.add_site(Some("kid"), "games.example").unwrap();
    h.engine.start_session("kid").unwrap();
    assert!(h.engine.lock_now());

    tokio::time::sleep(Duration::from_millis(61_500)).await;

    let status = h.engine.status();
    assert_eq!(status.session.phase, TimerPhase::Expired);
    assert_eq!(status.gate, GateState::Locked);
    assert_eq!(status.lock_reason, Some(LockReason::TimeExpired));

    assert_eq!(h.engine.unlock("kid-pw").unwrap(), UnlockOutcome::Unlocked);
    assert_eq!(h.engine.session().phase, TimerPhase::Idle);
    assert_eq!(h.engine.status().active_profile, None);
    assert!(h.engine.store().snapshot().sites.is_empty());
}

#[tokio::test]
async fn state_file_round_trips_the_policy_store() {
    let temp = assert_fs::TempDir::new().unwrap();
    let state_path = temp.child("state").child("state.json");
    let state = StateFile::new(state_path.path());

    let engine = Engine::new(
        &EngineConfig::default(),
        make_test_content(),
        Collaborators {
            interceptor: Arc::new(MockInterceptor::new()),
            resolver: Arc::new(MockResolver::new()),
            processes: Arc::new(MockProcessTable::new()),
            activity_processes: Arc::new(MockProcessTable::new()),
            pointer: Arc::new(MockPointer::new(0, 0)),
            notifier: Arc::new(RecordingNotifier::new()),
            checkpoint: Arc::new(state.clone()),
        },
        Handle::current(),
    );

    engine.add_site(None, "example.com").unwrap();
    engine.add_site(Some("kid"), "Games.Example").unwrap();
    engine.add_app(Some("kid"), "game.exe").unwrap();
    engine
        .create_profile("admin-pw", Profile::new("teen", 15, Credential::new("t"), 120))
        .unwrap();
    engine.store().set_kill_switch(true);
    engine.checkpoint().unwrap();

    let loaded = load_state(state_path.path()).unwrap().unwrap();
    assert_eq!(loaded, engine.store().content());
    assert!(loaded.profiles[0].blocked_sites.contains("games.example"));

    // Saving what was loaded changes nothing.
    state.save(&loaded).unwrap();
    assert_eq!(state.load_or_default().unwrap(), loaded);
}
