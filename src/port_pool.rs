use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Fixed set of local TCP ports lent out one holder at a time.
///
/// Free ports sit in a bounded channel sized to the pool, so a returned port
/// always fits back in. Every lease puts its port back when it is dropped,
/// whatever path the holder exits through.
#[derive(Debug, Clone)]
pub struct PortPool {
    returns: mpsc::Sender<u16>,
    free: Arc<Mutex<mpsc::Receiver<u16>>>,
    capacity: usize,
}

#[derive(Debug, Error)]
#[error("port pool has no ports")]
pub struct PoolEmpty;

/// Exclusive use of one pooled port.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    returns: mpsc::Sender<u16>,
}

impl PortPool {
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        let ports: Vec<u16> = ports.into_iter().collect();
        let capacity = ports.len();
        let (returns, free) = mpsc::channel(capacity.max(1));
        for port in ports {
            // Sized to fit every port.
            let _ = returns.try_send(port);
        }
        Self {
            returns,
            free: Arc::new(Mutex::new(free)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.returns.max_capacity() - self.returns.capacity()
    }

    pub fn borrowed(&self) -> usize {
        self.capacity - self.available()
    }

    /// Waits until a port is free and takes it. Waiters are served in
    /// arrival order.
    pub async fn acquire(&self) -> Result<PortLease, PoolEmpty> {
        if self.capacity == 0 {
            return Err(PoolEmpty);
        }
        let mut free = self.free.lock().await;
        let port = free.recv().await.ok_or(PoolEmpty)?;
        Ok(PortLease {
            port,
            returns: self.returns.clone(),
        })
    }
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if let Err(e) = self.returns.try_send(self.port) {
            warn!(port = self.port, error = %e, "could not return port to pool");
        }
    }
}
