//! Top-level scan session: owns all scan state and wires the enumerator,
//! probe scheduler and validation pipeline together.
//!
//! The session runs as a single loop that receives probe results, validation
//! events and control commands over channels, so `ScanState` has exactly one
//! owner and needs no lock. Consumers talk to it through [`SessionHandle`].

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ScanConfig, ValidationConfig};
use crate::enumerator::{Batches, RemainingWork};
use crate::error::{Result, ScanError};
use crate::gate::PauseGate;
use crate::prober::Probe;
use crate::proxy_check::ProxyProbe;
use crate::ranges::RangeList;
use crate::scheduler::{ProbeScheduler, ReorderSlot};
use crate::store::ScanState;
use crate::tool::ValidationTool;
use crate::types::{
    Notification, ProbeResult, RankedEntry, ScanOutcome, ScanStatus, ScanSummary, SessionState,
    ValidationState,
};
use crate::validator::{ValidationEvent, ValidationOrchestrator};

/// Upper bound on waiting for queued validations after probing completes.
pub const VALIDATION_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);
/// Teardown bound once validations are being cancelled.
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const NOTIFY_CAPACITY: usize = 1024;

enum Command {
    Status(oneshot::Sender<ScanStatus>),
    Ranked(oneshot::Sender<Vec<RankedEntry>>),
    Shuffle(oneshot::Sender<Result<usize>>),
}

/// Cloneable control and observation handle for a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    gate: PauseGate,
    cancel: CancellationToken,
    notify: broadcast::Sender<Notification>,
}

impl SessionHandle {
    /// Stops dispatch and draining at the next boundary. In-flight probes
    /// run to completion.
    pub fn pause(&self) -> bool {
        let changed = self.gate.pause();
        if changed {
            info!("scan paused");
            let _ = self.notify.send(Notification::Paused);
        }
        changed
    }

    pub fn resume(&self) -> bool {
        let changed = self.gate.resume();
        if changed {
            info!("scan resumed");
            let _ = self.notify.send(Notification::Resumed);
        }
        changed
    }

    pub fn is_paused(&self) -> bool {
        !self.gate.is_open()
    }

    /// Forced quit: cancels probing and validation and tears down every
    /// tunnel process.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!("stop requested");
        }
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Rebuilds and randomly permutes the not-yet-dispatched work. Only valid
    /// while paused; returns the size of the new work list.
    pub async fn shuffle(&self) -> Result<usize> {
        if !self.is_paused() {
            return Err(ScanError::NotPaused);
        }
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shuffle(tx)).await?;
        rx.await.map_err(|_| ScanError::SessionClosed)?
    }

    pub async fn snapshot(&self) -> Result<ScanStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx)).await?;
        rx.await.map_err(|_| ScanError::SessionClosed)
    }

    pub async fn ranked(&self) -> Result<Vec<RankedEntry>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Ranked(tx)).await?;
        rx.await.map_err(|_| ScanError::SessionClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify.subscribe()
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| ScanError::SessionClosed)
    }
}

/// One scan over a range list.
pub struct Session<P: Probe> {
    scan: ScanConfig,
    ranges: Arc<RangeList>,
    prober: Arc<P>,
    validator: Option<ValidationOrchestrator>,
    validation_rx: Option<mpsc::UnboundedReceiver<ValidationEvent>>,
    commands: mpsc::Receiver<Command>,
    handle: SessionHandle,
    reorder: ReorderSlot,
    state: ScanState,
    phase: SessionState,
}

impl<P: Probe> Session<P> {
    pub fn new(scan: ScanConfig, ranges: RangeList, prober: Arc<P>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        let total = ranges.total_addresses();
        Self {
            scan,
            ranges: Arc::new(ranges),
            prober,
            validator: None,
            validation_rx: None,
            commands: cmd_rx,
            handle: SessionHandle {
                commands: cmd_tx,
                gate: PauseGate::new(),
                cancel: CancellationToken::new(),
                notify,
            },
            reorder: ReorderSlot::new(),
            state: ScanState::new(total),
            phase: SessionState::Running,
        }
    }

    /// Enables tunnel validation of every found resolver.
    pub fn with_validation(
        mut self,
        cfg: ValidationConfig,
        tool: ValidationTool,
        proxy: Arc<dyn ProxyProbe>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = ValidationOrchestrator::new(
            cfg,
            tool,
            self.scan.domain.clone(),
            proxy,
            self.handle.gate.clone(),
            self.handle.cancel.child_token(),
            tx,
        )?;
        self.validator = Some(orchestrator);
        self.validation_rx = Some(rx);
        Ok(self)
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub async fn run(mut self) -> Result<ScanSummary> {
        let batch_size = self.scan.batch_size;
        info!(
            total = self.state.total(),
            concurrency = self.scan.effective_concurrency(),
            domain = %self.scan.domain,
            record_type = %self.scan.record_type,
            validation = self.validator.is_some(),
            "starting scan"
        );

        let (probe_tx, mut probe_rx) = mpsc::unbounded_channel();
        let scheduler = ProbeScheduler::new(
            self.prober.clone(),
            self.scan.effective_concurrency(),
            batch_size,
            probe_tx,
        )
        .with_gate(self.handle.gate.clone())
        .with_cancel(self.handle.cancel.clone())
        .with_reorder(self.reorder.clone());
        let source: Batches = Box::new(self.ranges.enumerate(batch_size));
        let probing = tokio::spawn(scheduler.run(source));

        loop {
            tokio::select! {
                maybe = probe_rx.recv() => match maybe {
                    Some(result) => self.on_probe(result),
                    None => break,
                },
                Some(event) = next_event(&mut self.validation_rx) => self.on_validation(event),
                Some(cmd) = self.commands.recv() => self.on_command(cmd).await,
            }
        }

        let outcome = match probing.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "probe scheduler task failed");
                ScanOutcome::Cancelled
            }
        };
        info!(
            scanned = self.state.scanned(),
            found = self.state.found(),
            ?outcome,
            "probing finished"
        );

        if outcome == ScanOutcome::Completed {
            self.drain_validation().await;
        }
        let forced = outcome == ScanOutcome::Cancelled || self.handle.is_stopped();
        if let Some(validator) = self.validator.take() {
            validator.shutdown(TEARDOWN_TIMEOUT).await;
        }
        let mut leftover = Vec::new();
        if let Some(rx) = self.validation_rx.as_mut() {
            while let Ok(event) = rx.try_recv() {
                leftover.push(event);
            }
        }
        for event in leftover {
            self.on_validation(event);
        }

        self.phase = if forced {
            SessionState::Cancelled
        } else {
            SessionState::Done
        };
        let status = self.status();
        let _ = self.handle.notify.send(Notification::Finished(status.clone()));
        info!(
            scanned = status.scanned,
            found = status.found,
            passed = status.passed,
            failed = status.failed,
            elapsed_s = status.elapsed_secs,
            "scan complete"
        );

        Ok(ScanSummary {
            outcome: if forced {
                ScanOutcome::Cancelled
            } else {
                ScanOutcome::Completed
            },
            status,
            validation_enabled: self.validator_enabled(),
            ranked: self.state.rank(),
        })
    }

    fn validator_enabled(&self) -> bool {
        self.validation_rx.is_some()
    }

    /// Lets queued validations finish, bounded by the drain timeout, while
    /// still serving events and commands.
    async fn drain_validation(&mut self) {
        let Some(tracker) = self.validator.as_ref().map(|v| v.tracker()) else {
            return;
        };
        self.phase = SessionState::Finishing;
        tracker.close();
        if !tracker.is_empty() {
            info!(
                outstanding = tracker.len(),
                timeout_s = VALIDATION_DRAIN_TIMEOUT.as_secs(),
                "waiting for validations"
            );
        }
        let cancel = self.handle.cancel.clone();
        let deadline = tokio::time::sleep(VALIDATION_DRAIN_TIMEOUT);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = tracker.wait() => break,
                _ = &mut deadline => {
                    warn!(outstanding = tracker.len(), "timed out waiting for validations");
                    break;
                }
                _ = cancel.cancelled() => break,
                Some(event) = next_event(&mut self.validation_rx) => self.on_validation(event),
                Some(cmd) = self.commands.recv() => self.on_command(cmd).await,
            }
        }
    }

    fn on_probe(&mut self, result: ProbeResult) {
        let newly_found = self.state.record_probe(&result);
        if self.state.scanned() % 1000 == 0 {
            debug!(
                scanned = self.state.scanned(),
                total = self.state.total(),
                found = self.state.found(),
                "scan progress"
            );
        }
        if !newly_found {
            return;
        }
        let address = result.address;
        info!(resolver = %address, latency_ms = result.latency.as_millis() as u64, "found resolver");
        let _ = self.handle.notify.send(Notification::ResolverFound {
            address,
            latency: result.latency,
        });
        if self.validator.is_none() {
            return;
        }
        self.advance(address, ValidationState::Pending);
        if let Some(validator) = self.validator.as_ref() {
            validator.submit(address);
        }
    }

    fn on_validation(&mut self, event: ValidationEvent) {
        match event {
            ValidationEvent::Testing(address) => self.advance(address, ValidationState::Testing),
            ValidationEvent::Finished {
                address,
                state,
                protocol,
            } => {
                if state == ValidationState::Success {
                    info!(resolver = %address, ?protocol, "tunnel validation passed");
                }
                self.advance(address, state);
            }
        }
    }

    fn advance(&mut self, address: Ipv4Addr, state: ValidationState) {
        if self.state.set_validation(address, state) {
            let _ = self
                .handle
                .notify
                .send(Notification::ValidationChanged { address, state });
        }
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Ranked(reply) => {
                let _ = reply.send(self.state.rank());
            }
            Command::Shuffle(reply) => {
                let _ = reply.send(self.shuffle().await);
            }
        }
    }

    async fn shuffle(&mut self) -> Result<usize> {
        if self.handle.gate.is_open() {
            return Err(ScanError::NotPaused);
        }
        if self.phase != SessionState::Running {
            return Err(ScanError::ProbingFinished);
        }
        let ranges = self.ranges.clone();
        let found = self.state.found_set();
        let batch_size = self.scan.batch_size;
        info!(found = found.len(), "rebuilding remaining work for shuffle");
        let work = tokio::task::spawn_blocking(move || {
            RemainingWork::rebuild(ranges.ranges(), batch_size, &found)
        })
        .await
        .map_err(|e| ScanError::Enumeration(e.to_string()))?;

        let remaining = work.len();
        if remaining > 100_000 {
            warn!(remaining, "shuffling a large work list; memory use grows with it");
        }
        self.reorder.install(work);
        info!(remaining, "shuffled remaining addresses");
        let _ = self.handle.notify.send(Notification::Shuffled { remaining });
        Ok(remaining)
    }

    fn status(&self) -> ScanStatus {
        let state = match self.phase {
            SessionState::Running | SessionState::Finishing if !self.handle.gate.is_open() => {
                SessionState::Paused
            }
            other => other,
        };
        self.state.status(state)
    }
}

async fn next_event(
    rx: &mut Option<mpsc::UnboundedReceiver<ValidationEvent>>,
) -> Option<ValidationEvent> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
