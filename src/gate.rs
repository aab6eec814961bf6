use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Shared pause barrier, initially open.
///
/// Closing the gate stops waiters at their next check; it never interrupts
/// work already past the gate.
#[derive(Debug, Clone)]
pub struct PauseGate {
    open: Arc<watch::Sender<bool>>,
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { open: Arc::new(tx) }
    }

    /// Returns `true` if this call closed an open gate.
    pub fn pause(&self) -> bool {
        self.open.send_replace(false)
    }

    /// Returns `true` if this call opened a closed gate.
    pub fn resume(&self) -> bool {
        !self.open.send_replace(true)
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    pub async fn wait_open(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Waits for the gate to open. Returns `false` if `cancel` fired first.
    pub async fn pass(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.wait_open() => !cancel.is_cancelled(),
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn open_gate_passes_immediately() {
        let gate = PauseGate::new();
        let cancel = CancellationToken::new();
        assert!(gate.pass(&cancel).await);
    }

    #[tokio::test]
    async fn paused_gate_blocks_until_resume() {
        let gate = PauseGate::new();
        assert!(gate.pause());
        assert!(!gate.pause());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_open().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        assert!(gate.resume());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_releases_paused_waiter() {
        let gate = PauseGate::new();
        gate.pause();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!gate.pass(&cancel).await);
    }
}
