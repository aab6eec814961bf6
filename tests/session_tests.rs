use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use resolver_scan_rs::config::ScanConfig;
use resolver_scan_rs::error::ScanError;
use resolver_scan_rs::prober::Probe;
use resolver_scan_rs::ranges::RangeList;
use resolver_scan_rs::session::{Session, SessionHandle};
use resolver_scan_rs::types::{
    Notification, ProbeResult, ScanOutcome, SessionState, ValidationState,
};
use tokio::sync::broadcast;

/// Answers for addresses whose last octet is at most `alive_up_to`, with the
/// last octet as latency in milliseconds.
struct FakeProbe {
    alive_up_to: u8,
    delay: Duration,
}

#[async_trait]
impl Probe for FakeProbe {
    async fn probe(&self, address: Ipv4Addr) -> ProbeResult {
        tokio::time::sleep(self.delay).await;
        let last = address.octets()[3];
        if last <= self.alive_up_to {
            ProbeResult::responsive(address, Duration::from_millis(u64::from(last)))
        } else {
            ProbeResult::unresponsive(address)
        }
    }
}

fn session(cidr: &str, probe: FakeProbe, concurrency: usize, batch: usize) -> Session<FakeProbe> {
    let mut cfg = ScanConfig::new("t.example.com");
    cfg.concurrency = concurrency;
    cfg.batch_size = batch;
    Session::new(cfg, RangeList::parse(cidr), Arc::new(probe))
}

async fn wait_for_found(rx: &mut broadcast::Receiver<Notification>, count: usize) {
    let mut seen = 0;
    while seen < count {
        if let Notification::ResolverFound { .. } = rx.recv().await.expect("notification") {
            seen += 1;
        }
    }
}

async fn settle_paused(handle: &SessionHandle) -> u64 {
    // Results already being drained when the gate closed may still land.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let scanned = handle.snapshot().await.unwrap().scanned;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(handle.snapshot().await.unwrap().scanned, scanned);
    scanned
}

#[tokio::test]
async fn completes_and_ranks_by_latency() {
    let s = session(
        "10.0.0.0/28",
        FakeProbe {
            alive_up_to: 7,
            delay: Duration::from_millis(1),
        },
        4,
        5,
    );
    let mut events = s.handle().subscribe();
    let summary = s.run().await.expect("run");

    assert_eq!(summary.outcome, ScanOutcome::Completed);
    assert_eq!(summary.status.state, SessionState::Done);
    assert_eq!(summary.status.total, 14);
    assert_eq!(summary.status.scanned, 14);
    assert_eq!(summary.status.found, 7);
    assert!(!summary.validation_enabled);

    let order: Vec<&str> = summary.ranked.iter().map(|e| e.address.as_str()).collect();
    let expected: Vec<String> = (1..=7).map(|i| format!("10.0.0.{i}")).collect();
    assert_eq!(order, expected.iter().map(String::as_str).collect::<Vec<_>>());
    assert!(summary
        .ranked
        .iter()
        .all(|e| e.validation == ValidationState::NotRequested));

    let mut finished = false;
    while let Ok(n) = events.try_recv() {
        if let Notification::Finished(status) = n {
            assert_eq!(status.found, 7);
            finished = true;
        }
    }
    assert!(finished);
}

#[tokio::test]
async fn pause_holds_progress_and_resume_loses_nothing() {
    let s = session(
        "10.1.0.0/24",
        FakeProbe {
            alive_up_to: 255,
            delay: Duration::from_millis(10),
        },
        4,
        16,
    );
    let handle = s.handle();
    let mut events = handle.subscribe();
    let run = tokio::spawn(s.run());

    wait_for_found(&mut events, 10).await;
    assert!(handle.pause());
    assert!(!handle.pause());
    assert!(handle.is_paused());
    assert_eq!(handle.snapshot().await.unwrap().state, SessionState::Paused);
    let held = settle_paused(&handle).await;
    assert!(held < 254);

    assert!(handle.resume());
    let summary = run.await.unwrap().expect("run");
    assert_eq!(summary.outcome, ScanOutcome::Completed);
    assert_eq!(summary.status.scanned, 254);
    assert_eq!(summary.status.found, 254);

    let mut found = HashSet::new();
    let mut paused = 0;
    let mut resumed = 0;
    while let Ok(n) = events.try_recv() {
        match n {
            Notification::ResolverFound { address, .. } => assert!(found.insert(address)),
            Notification::Paused => paused += 1,
            Notification::Resumed => resumed += 1,
            _ => {}
        }
    }
    // The first ten were consumed while waiting.
    assert_eq!(found.len(), 244);
    assert_eq!((paused, resumed), (1, 1));
}

#[tokio::test]
async fn shuffle_requires_pause() {
    let s = session(
        "10.2.0.0/24",
        FakeProbe {
            alive_up_to: 255,
            delay: Duration::from_millis(10),
        },
        2,
        8,
    );
    let handle = s.handle();
    let run = tokio::spawn(s.run());

    assert!(matches!(handle.shuffle().await, Err(ScanError::NotPaused)));
    handle.stop();
    let summary = run.await.unwrap().expect("run");
    assert_eq!(summary.outcome, ScanOutcome::Cancelled);
}

/// Answers for odd last octets and counts how often each address was asked.
#[derive(Default)]
struct Recorder {
    asked: Mutex<HashMap<Ipv4Addr, usize>>,
}

impl Recorder {
    fn times_asked(&self, address: Ipv4Addr) -> usize {
        self.asked.lock().unwrap().get(&address).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Probe for Recorder {
    async fn probe(&self, address: Ipv4Addr) -> ProbeResult {
        *self.asked.lock().unwrap().entry(address).or_default() += 1;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let last = address.octets()[3];
        if last % 2 == 1 {
            ProbeResult::responsive(address, Duration::from_millis(u64::from(last)))
        } else {
            ProbeResult::unresponsive(address)
        }
    }
}

#[tokio::test]
async fn shuffle_excludes_only_found_addresses() {
    let recorder = Arc::new(Recorder::default());
    let mut cfg = ScanConfig::new("t.example.com");
    cfg.concurrency = 2;
    cfg.batch_size = 4;
    let s = Session::new(cfg, RangeList::parse("10.3.0.0/24"), recorder.clone());
    let handle = s.handle();
    let mut events = handle.subscribe();
    let run = tokio::spawn(s.run());

    wait_for_found(&mut events, 5).await;
    handle.pause();
    settle_paused(&handle).await;
    let status = handle.snapshot().await.unwrap();
    let found_before: Vec<Ipv4Addr> = handle
        .ranked()
        .await
        .unwrap()
        .iter()
        .map(|e| e.address.parse().unwrap())
        .collect();
    assert_eq!(found_before.len() as u64, status.found);
    let dead_before: Vec<Ipv4Addr> = (1..=254u8)
        .filter(|last| last % 2 == 0)
        .map(|last| Ipv4Addr::new(10, 3, 0, last))
        .filter(|&ip| recorder.times_asked(ip) == 1)
        .collect();
    assert!(!dead_before.is_empty());

    let remaining = handle.shuffle().await.expect("shuffle while paused");
    // Addresses probed as unresponsive are not remembered and come back.
    assert_eq!(remaining as u64, 254 - status.found);

    handle.resume();
    let summary = run.await.unwrap().expect("run");
    assert_eq!(summary.outcome, ScanOutcome::Completed);
    assert_eq!(summary.status.found, 127);
    assert!(summary.status.scanned >= 254);

    for ip in &found_before {
        assert_eq!(recorder.times_asked(*ip), 1, "{ip} asked again after shuffle");
    }
    assert!(dead_before.iter().any(|&ip| recorder.times_asked(ip) >= 2));

    let unique: HashSet<&str> = summary.ranked.iter().map(|e| e.address.as_str()).collect();
    assert_eq!(unique.len(), summary.ranked.len());
}

#[tokio::test]
async fn stop_cancels_the_scan() {
    let s = session(
        "10.4.0.0/22",
        FakeProbe {
            alive_up_to: 255,
            delay: Duration::from_millis(20),
        },
        4,
        16,
    );
    let handle = s.handle();
    let mut events = handle.subscribe();
    let run = tokio::spawn(s.run());

    wait_for_found(&mut events, 1).await;
    handle.stop();
    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("stop is prompt")
        .unwrap()
        .expect("run");
    assert_eq!(summary.outcome, ScanOutcome::Cancelled);
    assert_eq!(summary.status.state, SessionState::Cancelled);
    assert!(summary.status.scanned < summary.status.total);

    assert!(matches!(handle.snapshot().await, Err(ScanError::SessionClosed)));
}
