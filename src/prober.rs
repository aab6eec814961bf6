//! Single-query DNS liveness probe.

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::ProtoError;
use rand::Rng;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::config::ScanConfig;
use crate::types::ProbeResult;

/// Classifies one candidate address as a live resolver or not.
///
/// Implementations must never panic or return an error: every failure mode
/// maps to an unresponsive result.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn probe(&self, address: Ipv4Addr) -> ProbeResult;
}

/// Why a single exchange produced no usable reply.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid query name {name:?}: {source}")]
    Name {
        name: String,
        #[source]
        source: ProtoError,
    },

    #[error("failed to encode query: {0}")]
    Encode(#[source] ProtoError),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sends exactly one UDP query per candidate, without retry.
#[derive(Debug, Clone)]
pub struct DnsProber {
    domain: String,
    record_type: RecordType,
    random_label: bool,
    port: u16,
    timeout: Duration,
}

impl DnsProber {
    pub fn new(domain: impl Into<String>, record_type: RecordType) -> Self {
        Self {
            domain: domain.into(),
            record_type,
            random_label: false,
            port: 53,
            timeout: Duration::from_secs(2),
        }
    }

    pub fn from_config(cfg: &ScanConfig) -> Self {
        Self {
            domain: cfg.domain.trim().trim_end_matches('.').to_string(),
            record_type: cfg.record_type,
            random_label: cfg.random_subdomain,
            port: cfg.dns_port,
            timeout: cfg.probe_timeout,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_random_label(mut self, enabled: bool) -> Self {
        self.random_label = enabled;
        self
    }

    /// Name to query; optionally prefixed with eight random hex digits.
    pub fn query_name(&self) -> String {
        if self.random_label {
            let label: u32 = rand::rng().random();
            format!("{label:08x}.{}", self.domain)
        } else {
            self.domain.clone()
        }
    }

    fn build_query(&self) -> Result<(u16, Vec<u8>), QueryError> {
        let name = self.query_name();
        let name = Name::from_str(&name).map_err(|source| QueryError::Name { name, source })?;
        let id: u16 = rand::rng().random();
        let mut msg = Message::new();
        msg.set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name, self.record_type));
        let bytes = msg.to_vec().map_err(QueryError::Encode)?;
        Ok((id, bytes))
    }

    async fn exchange(&self, target: SocketAddr) -> Result<(ResponseCode, Duration), QueryError> {
        let (id, query) = self.build_query()?;
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(target).await?;

        let start = Instant::now();
        socket.send(&query).await?;

        let mut buf = vec![0u8; 4096];
        loop {
            let n = socket.recv(&mut buf).await?;
            let Ok(reply) = Message::from_vec(&buf[..n]) else {
                continue;
            };
            if reply.id() != id || reply.message_type() != MessageType::Response {
                continue;
            }
            return Ok((reply.response_code(), start.elapsed()));
        }
    }
}

/// Response codes that prove a live resolver even without an answer.
pub fn proves_liveness(code: ResponseCode) -> bool {
    matches!(
        code,
        ResponseCode::NoError | ResponseCode::NXDomain | ResponseCode::NXRRSet | ResponseCode::NotImp
    )
}

#[async_trait]
impl Probe for DnsProber {
    async fn probe(&self, address: Ipv4Addr) -> ProbeResult {
        let target = SocketAddr::from((address, self.port));
        match time::timeout(self.timeout, self.exchange(target)).await {
            Ok(Ok((code, latency))) if proves_liveness(code) && latency < self.timeout => {
                debug!(address = %address, ?code, latency_ms = latency.as_millis() as u64, "resolver responded");
                ProbeResult::responsive(address, latency)
            }
            Ok(Ok((code, latency))) => {
                debug!(address = %address, ?code, latency_ms = latency.as_millis() as u64, "resolver rejected");
                ProbeResult::unresponsive(address)
            }
            Ok(Err(e)) => {
                debug!(address = %address, error = %e, "probe transport failure");
                ProbeResult::unresponsive(address)
            }
            Err(_) => ProbeResult::unresponsive(address),
        }
    }
}
