use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;
use tracing::{debug, info};

use crate::enumerator::AddressEnumerator;
use crate::error::{Result, ScanError};

/// Parsed contents of a range-list file.
///
/// Supported formats per line:
/// - CIDR: `10.0.0.0/8` (host bits are allowed and truncated)
/// - bare address: `192.0.2.7` (treated as `/32`)
/// - comments: everything after `#` is ignored
/// - whitespace and blank lines are ignored
///
/// Malformed lines are skipped without failing the whole parse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeList {
    ranges: Vec<Ipv4Net>,
    skipped: usize,
}

impl RangeList {
    pub fn parse(s: &str) -> Self {
        let mut ranges = Vec::new();
        let mut skipped = 0usize;

        for (idx, raw_line) in s.lines().enumerate() {
            let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
            if line.is_empty() {
                continue;
            }
            match parse_range(line) {
                Some(net) => ranges.push(net),
                None => {
                    skipped += 1;
                    debug!(line_no = idx + 1, line = %truncate(line, 50), "skipping invalid range line");
                }
            }
        }

        Self { ranges, skipped }
    }

    pub fn from_ranges(ranges: Vec<Ipv4Net>) -> Self {
        Self { ranges, skipped: 0 }
    }

    /// Blocking read of a range file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ScanError::RangeFile {
            path: path.to_path_buf(),
            source,
        })?;
        let list = Self::parse(&content);
        info!(
            path = %path.display(),
            ranges = list.ranges.len(),
            skipped = list.skipped,
            "loaded range file"
        );
        Ok(list)
    }

    /// Reads the file on the blocking pool and rejects lists with no usable
    /// addresses.
    pub async fn load_async(path: PathBuf) -> Result<Self> {
        let p = path.clone();
        let list = tokio::task::spawn_blocking(move || Self::load(p))
            .await
            .map_err(|e| ScanError::Enumeration(e.to_string()))??;
        if list.total_addresses() == 0 {
            return Err(ScanError::NoAddresses { path });
        }
        Ok(list)
    }

    pub fn ranges(&self) -> &[Ipv4Net] {
        &self.ranges
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Authoritative work total used for progress reporting, computed
    /// without expanding any range.
    pub fn total_addresses(&self) -> u64 {
        self.ranges.iter().copied().map(host_count).sum()
    }

    /// Starts a fresh randomized streaming pass over all ranges.
    pub fn enumerate(&self, batch_size: usize) -> AddressEnumerator {
        AddressEnumerator::new(self.ranges.clone(), batch_size)
    }
}

/// Addresses a range contributes: all of them for `/31` and `/32`, otherwise
/// everything except the network and broadcast addresses.
pub fn host_count(net: Ipv4Net) -> u64 {
    let size = 1u64 << (32 - u32::from(net.prefix_len()));
    if net.prefix_len() >= 31 {
        size
    } else {
        size - 2
    }
}

fn parse_range(line: &str) -> Option<Ipv4Net> {
    if line.contains('/') {
        line.parse::<Ipv4Net>().ok().map(|n| n.trunc())
    } else {
        line.parse::<Ipv4Addr>()
            .ok()
            .and_then(|ip| Ipv4Net::new(ip, 32).ok())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
