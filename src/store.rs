use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::types::{ProbeResult, RankedEntry, ScanStatus, SessionState, ValidationState};

/// Aggregate state of one scan, owned by the session loop.
#[derive(Debug)]
pub struct ScanState {
    latencies: HashMap<Ipv4Addr, Duration>,
    validation: HashMap<Ipv4Addr, ValidationState>,
    scanned: u64,
    total: u64,
    started: Instant,
}

impl ScanState {
    pub fn new(total: u64) -> Self {
        Self {
            latencies: HashMap::new(),
            validation: HashMap::new(),
            scanned: 0,
            total,
            started: Instant::now(),
        }
    }

    /// Counts the probe and records a responsive address. Returns `true` only
    /// the first time an address is found.
    pub fn record_probe(&mut self, result: &ProbeResult) -> bool {
        self.scanned += 1;
        if !result.responsive || self.latencies.contains_key(&result.address) {
            return false;
        }
        self.latencies.insert(result.address, result.latency);
        true
    }

    /// Applies a validation transition if it moves forward; regressions and
    /// transitions for unknown addresses are ignored.
    pub fn set_validation(&mut self, address: Ipv4Addr, next: ValidationState) -> bool {
        if !self.latencies.contains_key(&address) {
            return false;
        }
        let current = self.validation_of(address);
        if !current.can_advance_to(next) {
            debug!(address = %address, ?current, ?next, "ignoring validation transition");
            return false;
        }
        self.validation.insert(address, next);
        true
    }

    pub fn validation_of(&self, address: Ipv4Addr) -> ValidationState {
        self.validation
            .get(&address)
            .copied()
            .unwrap_or(ValidationState::NotRequested)
    }

    pub fn latency_of(&self, address: Ipv4Addr) -> Option<Duration> {
        self.latencies.get(&address).copied()
    }

    pub fn is_found(&self, address: Ipv4Addr) -> bool {
        self.latencies.contains_key(&address)
    }

    pub fn found_set(&self) -> HashSet<Ipv4Addr> {
        self.latencies.keys().copied().collect()
    }

    pub fn found(&self) -> u64 {
        self.latencies.len() as u64
    }

    pub fn scanned(&self) -> u64 {
        self.scanned
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn count_state(&self, state: ValidationState) -> u64 {
        self.validation.values().filter(|s| **s == state).count() as u64
    }

    pub fn passed(&self) -> u64 {
        self.count_state(ValidationState::Success)
    }

    pub fn failed(&self) -> u64 {
        self.count_state(ValidationState::Failed)
    }

    pub fn status(&self, state: SessionState) -> ScanStatus {
        let elapsed = self.elapsed().as_secs_f64();
        ScanStatus {
            state,
            total: self.total,
            scanned: self.scanned,
            found: self.found(),
            passed: self.passed(),
            failed: self.failed(),
            elapsed_secs: elapsed,
            per_second: if elapsed > 0.0 {
                self.scanned as f64 / elapsed
            } else {
                0.0
            },
        }
    }

    pub fn rank(&self) -> Vec<RankedEntry> {
        rank(
            self.latencies
                .iter()
                .map(|(ip, lat)| (*ip, *lat, self.validation_of(*ip))),
        )
    }
}

/// Presentation order: Success, Testing, Pending, NotRequested, Failed, then
/// ascending latency inside each tier. Address breaks remaining ties.
pub fn rank(
    entries: impl IntoIterator<Item = (Ipv4Addr, Duration, ValidationState)>,
) -> Vec<RankedEntry> {
    let mut rows: Vec<(Ipv4Addr, Duration, ValidationState)> = entries.into_iter().collect();
    rows.sort_by_key(|(ip, latency, state)| (state.rank_tier(), *latency, *ip));
    rows.into_iter()
        .map(|(ip, latency, validation)| RankedEntry {
            address: ip.to_string(),
            latency_ms: latency.as_millis() as u64,
            validation,
        })
        .collect()
}
