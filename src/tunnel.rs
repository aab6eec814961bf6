//! Lifecycle of one tunnel-client process.
//!
//! `Spawned -> WaitingForReady -> Connected -> ProtocolProbe -> Terminated`.
//! Every exit path ends in `Terminated`: the caller must `terminate()` the
//! tunnel, and `kill_on_drop` covers tasks that are aborted instead.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelPhase {
    Spawned,
    WaitingForReady,
    Connected,
    ProtocolProbe,
    Terminated,
}

/// A running tunnel client with stdout and stderr merged into one line
/// stream.
#[derive(Debug)]
pub struct Tunnel {
    child: Child,
    output: Option<mpsc::UnboundedReceiver<String>>,
    phase: TunnelPhase,
    resolver: Ipv4Addr,
    port: u16,
}

impl Tunnel {
    pub fn spawn(
        program: &Path,
        args: &[String],
        resolver: Ipv4Addr,
        port: u16,
    ) -> Result<Self, ValidationError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ValidationError::Spawn)?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx);
        }

        debug!(resolver = %resolver, port, pid = ?child.id(), "tunnel client spawned");
        Ok(Self {
            child,
            output: Some(rx),
            phase: TunnelPhase::Spawned,
            resolver,
            port,
        })
    }

    pub fn phase(&self) -> TunnelPhase {
        self.phase
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Reads merged output until a line contains `marker`.
    ///
    /// Fails if the stream ends first (the process exited) or `deadline`
    /// elapses.
    pub async fn wait_ready(&mut self, marker: &str, deadline: Duration) -> Result<(), ValidationError> {
        self.phase = TunnelPhase::WaitingForReady;
        let Some(mut output) = self.output.take() else {
            return Err(ValidationError::EarlyExit);
        };
        let resolver = self.resolver;

        let scan = async {
            let mut line_no = 0usize;
            while let Some(line) = output.recv().await {
                line_no += 1;
                debug!(resolver = %resolver, line_no, line = %line, "tunnel output");
                if line.contains(marker) {
                    return true;
                }
            }
            false
        };

        let outcome = time::timeout(deadline, scan).await;
        match outcome {
            Ok(true) => {
                // Later output is discarded by the forwarders once the
                // receiver is gone, so the pipes never fill up.
                drop(output);
                self.phase = TunnelPhase::Connected;
                info!(resolver = %resolver, port = self.port, "tunnel ready");
                Ok(())
            }
            Ok(false) => {
                warn!(resolver = %resolver, "tunnel client exited before becoming ready");
                Err(ValidationError::EarlyExit)
            }
            Err(_) => {
                warn!(resolver = %resolver, timeout_s = deadline.as_secs_f64(), "tunnel readiness timed out");
                Err(ValidationError::ReadyTimeout(deadline))
            }
        }
    }

    pub fn begin_protocol_probe(&mut self) {
        self.phase = TunnelPhase::ProtocolProbe;
    }

    /// Force-kills the process and waits for it to exit.
    pub async fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            // Already exited on its own.
            debug!(resolver = %self.resolver, error = %e, "tunnel kill skipped");
        }
        if let Err(e) = self.child.wait().await {
            debug!(resolver = %self.resolver, error = %e, "tunnel wait failed");
        }
        self.phase = TunnelPhase::Terminated;
    }
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            // Keep draining even after the reader side is dropped.
            let _ = tx.send(line.trim().to_string());
        }
    });
}

#[derive(Debug)]
struct TrackedProcess {
    resolver: Ipv4Addr,
    pid: Option<u32>,
    kill: CancellationToken,
}

/// Process-wide list of live tunnel clients used for the shutdown sweep.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: AtomicU64,
    procs: Mutex<HashMap<u64, TrackedProcess>>,
    emptied: Notify,
}

/// Deregisters a tracked process when dropped.
#[derive(Debug)]
pub struct TrackedGuard {
    id: u64,
    registry: ProcessRegistry,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a process; it should watch `kill` and terminate itself when
    /// the token fires.
    pub fn track(&self, resolver: Ipv4Addr, pid: Option<u32>, kill: CancellationToken) -> TrackedGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut procs) = self.inner.procs.lock() {
            procs.insert(id, TrackedProcess { resolver, pid, kill });
        }
        TrackedGuard {
            id,
            registry: self.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.procs.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        let now_empty = match self.inner.procs.lock() {
            Ok(mut procs) => {
                procs.remove(&id);
                procs.is_empty()
            }
            Err(_) => false,
        };
        if now_empty {
            self.inner.emptied.notify_waiters();
        }
    }

    /// Signals every tracked process to terminate and waits, up to `timeout`,
    /// until all of them have been killed, awaited and deregistered.
    /// Returns `true` if the registry drained in time.
    pub async fn sweep(&self, timeout: Duration) -> bool {
        if let Ok(procs) = self.inner.procs.lock() {
            for p in procs.values() {
                debug!(resolver = %p.resolver, pid = ?p.pid, "sweeping tunnel client");
                p.kill.cancel();
            }
        }
        let drained = time::timeout(timeout, async {
            loop {
                let notified = self.inner.emptied.notified();
                if self.is_empty() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok();
        if !drained {
            warn!(remaining = self.len(), "tunnel clients still running after sweep timeout");
        }
        drained
    }
}

impl Drop for TrackedGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
