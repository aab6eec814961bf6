use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Outcome of a single probe against one candidate resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub address: Ipv4Addr,
    pub responsive: bool,
    /// Only meaningful when `responsive` is true; zero otherwise.
    pub latency: Duration,
}

impl ProbeResult {
    pub fn responsive(address: Ipv4Addr, latency: Duration) -> Self {
        Self {
            address,
            responsive: true,
            latency,
        }
    }

    pub fn unresponsive(address: Ipv4Addr) -> Self {
        Self {
            address,
            responsive: false,
            latency: Duration::ZERO,
        }
    }
}

/// Tunnel validation status of a found resolver.
///
/// Transitions only move forward: `NotRequested -> Pending -> Testing ->
/// {Success, Failed}`. A pending attempt that is cancelled before it starts
/// goes straight to `Failed`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    NotRequested,
    Pending,
    Testing,
    Success,
    Failed,
}

impl ValidationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Presentation tier: lower sorts first.
    pub fn rank_tier(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Testing => 1,
            Self::Pending => 2,
            Self::NotRequested => 3,
            Self::Failed => 4,
        }
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotRequested, Self::Pending)
                | (Self::Pending, Self::Testing)
                | (Self::Pending, Self::Failed)
                | (Self::Testing, Self::Success)
                | (Self::Testing, Self::Failed)
        )
    }
}

/// Proxy mechanism that carried a successful validation request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProxyProtocol {
    Http,
    Socks5,
}

impl ProxyProtocol {
    /// Fixed fallback order.
    pub const ORDER: [ProxyProtocol; 2] = [ProxyProtocol::Http, ProxyProtocol::Socks5];

    pub fn scheme(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Socks5 => "socks5",
        }
    }
}

/// One found resolver in presentation order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RankedEntry {
    pub address: String,
    pub latency_ms: u64,
    pub validation: ValidationState,
}

/// Lifecycle of a scan session as seen by consumers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Running,
    Paused,
    Finishing,
    Done,
    Cancelled,
}

/// Counters snapshot for progress consumers.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ScanStatus {
    pub state: SessionState,
    pub total: u64,
    pub scanned: u64,
    pub found: u64,
    pub passed: u64,
    pub failed: u64,
    pub elapsed_secs: f64,
    pub per_second: f64,
}

/// How the probe scheduler stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed,
    Cancelled,
}

/// Outbound notifications for subscribers of a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    ResolverFound { address: Ipv4Addr, latency: Duration },
    ValidationChanged { address: Ipv4Addr, state: ValidationState },
    Paused,
    Resumed,
    Shuffled { remaining: usize },
    Finished(ScanStatus),
}

/// Final result of a session run.
#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub outcome: ScanOutcome,
    pub status: ScanStatus,
    pub validation_enabled: bool,
    pub ranked: Vec<RankedEntry>,
}
