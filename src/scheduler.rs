use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::enumerator::{Batches, RemainingWork};
use crate::gate::PauseGate;
use crate::prober::Probe;
use crate::types::{ProbeResult, ScanOutcome};

/// Slot through which a rebuilt, shuffled work list replaces the forward-only
/// enumerator at the next batch boundary.
#[derive(Debug, Clone, Default)]
pub struct ReorderSlot {
    inner: Arc<Mutex<Option<RemainingWork>>>,
}

impl ReorderSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, work: RemainingWork) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = Some(work);
        }
    }

    pub fn take(&self) -> Option<RemainingWork> {
        self.inner.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Bounded-concurrency driver that feeds batches of candidates to a prober.
///
/// Two throttles apply: a semaphore bounds concurrent network probes, and
/// the number of outstanding tasks is drained back below `batch_size` after
/// every dispatched batch.
pub struct ProbeScheduler<P: Probe> {
    prober: Arc<P>,
    concurrency: usize,
    batch_size: usize,
    gate: PauseGate,
    cancel: CancellationToken,
    reorder: ReorderSlot,
    results: mpsc::UnboundedSender<ProbeResult>,
}

impl<P: Probe> ProbeScheduler<P> {
    pub fn new(
        prober: Arc<P>,
        concurrency: usize,
        batch_size: usize,
        results: mpsc::UnboundedSender<ProbeResult>,
    ) -> Self {
        Self {
            prober,
            concurrency: concurrency.max(1),
            batch_size: batch_size.max(1),
            gate: PauseGate::new(),
            cancel: CancellationToken::new(),
            reorder: ReorderSlot::new(),
            results,
        }
    }

    pub fn with_gate(mut self, gate: PauseGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_reorder(mut self, reorder: ReorderSlot) -> Self {
        self.reorder = reorder;
        self
    }

    /// Probes every address produced by `source`, reporting each dispatched
    /// probe's result exactly once through the results channel.
    pub async fn run(self, mut source: Batches) -> ScanOutcome {
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<ProbeResult> = JoinSet::new();
        let mut in_flight: HashMap<task::Id, Ipv4Addr> = HashMap::new();

        loop {
            if !self.gate.pass(&self.cancel).await {
                return self.abort(tasks);
            }
            if let Some(work) = self.reorder.take() {
                info!(remaining = work.len(), "switching to shuffled work list");
                source = Box::new(work);
            }
            let Some(batch) = source.next() else {
                break;
            };

            for ip in batch {
                let prober = self.prober.clone();
                let sem = sem.clone();
                let gate = self.gate.clone();
                let cancel = self.cancel.clone();
                let handle = tasks.spawn(async move {
                    // Queued probes also honour pause; started ones run to completion.
                    if !gate.pass(&cancel).await {
                        return ProbeResult::unresponsive(ip);
                    }
                    let Ok(_permit) = sem.acquire_owned().await else {
                        return ProbeResult::unresponsive(ip);
                    };
                    prober.probe(ip).await
                });
                in_flight.insert(handle.id(), ip);
            }

            while tasks.len() >= self.batch_size {
                if !self.gate.pass(&self.cancel).await {
                    return self.abort(tasks);
                }
                if !self.drain(&mut tasks, &mut in_flight).await {
                    return self.abort(tasks);
                }
            }
        }

        while !tasks.is_empty() {
            if !self.gate.pass(&self.cancel).await {
                return self.abort(tasks);
            }
            if !self.drain(&mut tasks, &mut in_flight).await {
                return self.abort(tasks);
            }
        }

        ScanOutcome::Completed
    }

    /// Waits for at least one task, then collects every other task that has
    /// already finished. Returns `false` if cancelled while waiting.
    async fn drain(
        &self,
        tasks: &mut JoinSet<ProbeResult>,
        in_flight: &mut HashMap<task::Id, Ipv4Addr>,
    ) -> bool {
        let first = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            next = tasks.join_next_with_id() => next,
        };
        let Some(first) = first else {
            return true;
        };
        self.report(first, in_flight);
        while let Some(done) = tasks.try_join_next_with_id() {
            self.report(done, in_flight);
        }
        true
    }

    fn report(
        &self,
        done: Result<(task::Id, ProbeResult), task::JoinError>,
        in_flight: &mut HashMap<task::Id, Ipv4Addr>,
    ) {
        let result = match done {
            Ok((id, result)) => {
                in_flight.remove(&id);
                result
            }
            Err(err) => {
                let Some(ip) = in_flight.remove(&err.id()) else {
                    error!(error = %err, "probe task failed for an untracked address");
                    return;
                };
                error!(address = %ip, error = %err, "probe task failed");
                ProbeResult::unresponsive(ip)
            }
        };
        // Receiver gone means the session is shutting down.
        let _ = self.results.send(result);
    }

    fn abort(&self, mut tasks: JoinSet<ProbeResult>) -> ScanOutcome {
        debug!(outstanding = tasks.len(), "cancelling outstanding probes");
        tasks.abort_all();
        ScanOutcome::Cancelled
    }
}
