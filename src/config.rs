use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use hickory_proto::rr::RecordType;

use crate::error::{Result, ScanError};

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const MAX_PROBE_CONCURRENCY: usize = 10_000;

/// Parameters for the probing phase.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub domain: String,
    pub record_type: RecordType,
    pub concurrency: usize,
    pub batch_size: usize,
    pub probe_timeout: Duration,
    /// Prefix each query with a random label to defeat resolver caches.
    pub random_subdomain: bool,
    pub dns_port: u16,
}

impl ScanConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            record_type: RecordType::A,
            concurrency: 100,
            batch_size: DEFAULT_BATCH_SIZE,
            probe_timeout: Duration::from_secs(2),
            random_subdomain: false,
            dns_port: 53,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.domain.trim().is_empty() {
            return Err(ScanError::Config("domain must not be empty".into()));
        }
        if self.concurrency == 0 {
            return Err(ScanError::Config("probe concurrency must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(ScanError::Config("batch size must be at least 1".into()));
        }
        if self.probe_timeout.is_zero() {
            return Err(ScanError::Config("probe timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_PROBE_CONCURRENCY)
    }
}

/// Optional proxy credentials for the validation tunnel.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

/// Parameters for the tunnel validation phase.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub tool: PathBuf,
    pub concurrency: usize,
    pub base_port: u16,
    pub fallback_resolver: String,
    pub ready_marker: String,
    pub ready_timeout: Duration,
    pub settle_delay: Duration,
    pub proxy_timeout: Duration,
    pub target_url: String,
    pub accepted_statuses: Vec<u16>,
    pub credentials: Option<Credentials>,
}

impl ValidationConfig {
    pub fn new(tool: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            concurrency: 5,
            base_port: 10800,
            fallback_resolver: "8.8.4.4:53".into(),
            ready_marker: "Connection ready".into(),
            ready_timeout: Duration::from_secs(15),
            settle_delay: Duration::from_millis(1500),
            proxy_timeout: Duration::from_secs(15),
            target_url: "http://google.com".into(),
            accepted_statuses: vec![200, 301, 302],
            credentials: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(ScanError::Config(
                "validation concurrency must be at least 1".into(),
            ));
        }
        if self.base_port == 0 {
            return Err(ScanError::Config("base port must not be 0".into()));
        }
        let last = u16::try_from(self.concurrency - 1)
            .ok()
            .and_then(|span| self.base_port.checked_add(span));
        if last.is_none() {
            return Err(ScanError::Config(format!(
                "{} ports starting at {} do not fit in the TCP port range",
                self.concurrency, self.base_port
            )));
        }
        if let Some(c) = &self.credentials {
            if c.username.is_empty() {
                return Err(ScanError::Config("proxy username must not be empty".into()));
            }
        }
        if self.accepted_statuses.is_empty() {
            return Err(ScanError::Config("accepted status list is empty".into()));
        }
        Ok(())
    }

    /// Ports reserved for the pool: `base_port .. base_port + concurrency`.
    /// Fails when the range leaves the TCP port space, so the pool always
    /// holds exactly `concurrency` ports.
    pub fn ports(&self) -> Result<Vec<u16>> {
        self.validate()?;
        Ok((0..self.concurrency)
            .filter_map(|i| u16::try_from(i).ok())
            .map(|i| self.base_port + i)
            .collect())
    }
}
