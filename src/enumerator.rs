//! Lazy, randomized expansion of CIDR ranges into candidate batches.
//!
//! Ranges are shuffled, ranges coarser than a /24 are split into /24 blocks
//! visited in random order, and the hosts of each block are shuffled before
//! being emitted. At most one block's hosts are materialized at a time.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Any forward-only source of address batches the scheduler can consume.
pub type Batches = Box<dyn Iterator<Item = Vec<Ipv4Addr>> + Send>;

const BLOCK_PREFIX: u8 = 24;

/// Finite, non-restartable stream of address batches over a range list.
///
/// Every batch holds `batch_size` addresses except possibly the last.
#[derive(Debug)]
pub struct AddressEnumerator {
    ranges: std::vec::IntoIter<Ipv4Net>,
    blocks: Option<BlockCursor>,
    hosts: std::vec::IntoIter<Ipv4Addr>,
    batch_size: usize,
    rng: StdRng,
}

#[derive(Debug)]
struct BlockCursor {
    base: u32,
    prefix: u8,
    order: std::vec::IntoIter<u32>,
}

impl AddressEnumerator {
    pub fn new(mut ranges: Vec<Ipv4Net>, batch_size: usize) -> Self {
        // StdRng is a CSPRNG; seeding from the OS keeps scan order unpredictable.
        let mut rng = StdRng::from_os_rng();
        ranges.shuffle(&mut rng);
        Self {
            ranges: ranges.into_iter(),
            blocks: None,
            hosts: Vec::new().into_iter(),
            batch_size: batch_size.max(1),
            rng,
        }
    }

    fn next_block(&mut self) -> Option<Ipv4Net> {
        loop {
            if let Some(cursor) = self.blocks.as_mut() {
                if let Some(idx) = cursor.order.next() {
                    let start = cursor.base + (idx << (32 - u32::from(BLOCK_PREFIX)));
                    return Ipv4Net::new(Ipv4Addr::from(start), cursor.prefix).ok();
                }
            }
            let range = self.ranges.next()?;
            self.blocks = Some(self.split_range(range));
        }
    }

    fn split_range(&mut self, range: Ipv4Net) -> BlockCursor {
        let base = u32::from(range.network());
        if range.prefix_len() >= BLOCK_PREFIX {
            return BlockCursor {
                base,
                prefix: range.prefix_len(),
                order: vec![0].into_iter(),
            };
        }
        let count = 1u32 << (BLOCK_PREFIX - range.prefix_len());
        let mut order: Vec<u32> = (0..count).collect();
        order.shuffle(&mut self.rng);
        BlockCursor {
            base,
            prefix: BLOCK_PREFIX,
            order: order.into_iter(),
        }
    }

    fn next_address(&mut self) -> Option<Ipv4Addr> {
        loop {
            if let Some(ip) = self.hosts.next() {
                return Some(ip);
            }
            let block = self.next_block()?;
            let mut hosts = block_hosts(block);
            hosts.shuffle(&mut self.rng);
            self.hosts = hosts.into_iter();
        }
    }
}

impl Iterator for AddressEnumerator {
    type Item = Vec<Ipv4Addr>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            match self.next_address() {
                Some(ip) => batch.push(ip),
                None => break,
            }
        }
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}

/// Host addresses of one block. `/31` and `/32` keep every address; larger
/// blocks drop their network and broadcast addresses.
pub fn block_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if net.prefix_len() >= 31 {
        return (start..=end).map(Ipv4Addr::from).collect();
    }
    (start + 1..end).map(Ipv4Addr::from).collect()
}

/// Explicit, shuffled list of not-yet-dispatched work, built only when a
/// reorder is requested.
///
/// The list is rebuilt by enumerating every range again and dropping only
/// addresses already known to be found. Addresses that were probed and
/// classified non-responsive are not remembered and will be probed again.
#[derive(Debug)]
pub struct RemainingWork {
    addresses: std::vec::IntoIter<Ipv4Addr>,
    len: usize,
    batch_size: usize,
}

impl RemainingWork {
    pub fn rebuild(ranges: &[Ipv4Net], batch_size: usize, found: &HashSet<Ipv4Addr>) -> Self {
        let mut all: Vec<Ipv4Addr> = AddressEnumerator::new(ranges.to_vec(), batch_size)
            .flatten()
            .filter(|ip| !found.contains(ip))
            .collect();
        all.shuffle(&mut StdRng::from_os_rng());
        Self::from_list(all, batch_size)
    }

    pub fn from_list(addresses: Vec<Ipv4Addr>, batch_size: usize) -> Self {
        Self {
            len: addresses.len(),
            addresses: addresses.into_iter(),
            batch_size: batch_size.max(1),
        }
    }

    /// Addresses in the list when it was built.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Iterator for RemainingWork {
    type Item = Vec<Ipv4Addr>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch: Vec<Ipv4Addr> = self.addresses.by_ref().take(self.batch_size).collect();
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}
