//! Secondary pipeline that checks found resolvers as tunnel proxies.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::ValidationConfig;
use crate::error::ValidationError;
use crate::gate::PauseGate;
use crate::port_pool::PortPool;
use crate::proxy_check::ProxyProbe;
use crate::tool::ValidationTool;
use crate::tunnel::{ProcessRegistry, Tunnel};
use crate::types::{ProxyProtocol, ValidationState};

/// Progress reported by validation tasks to the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationEvent {
    Testing(Ipv4Addr),
    Finished {
        address: Ipv4Addr,
        state: ValidationState,
        protocol: Option<ProxyProtocol>,
    },
}

struct Context {
    cfg: ValidationConfig,
    tool: ValidationTool,
    domain: String,
    proxy: Arc<dyn ProxyProbe>,
    permits: Arc<Semaphore>,
    ports: PortPool,
    gate: PauseGate,
    registry: ProcessRegistry,
    events: mpsc::UnboundedSender<ValidationEvent>,
}

/// Runs at most `cfg.concurrency` validations at once, each holding one port
/// from a pool of the same size.
pub struct ValidationOrchestrator {
    ctx: Arc<Context>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl ValidationOrchestrator {
    pub fn new(
        cfg: ValidationConfig,
        tool: ValidationTool,
        domain: impl Into<String>,
        proxy: Arc<dyn ProxyProbe>,
        gate: PauseGate,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<ValidationEvent>,
    ) -> crate::error::Result<Self> {
        let ports = PortPool::new(cfg.ports()?);
        let permits = Arc::new(Semaphore::new(ports.capacity().max(1)));
        Ok(Self {
            ctx: Arc::new(Context {
                cfg,
                tool,
                domain: domain.into(),
                proxy,
                permits,
                ports,
                gate,
                registry: ProcessRegistry::new(),
                events,
            }),
            tracker: TaskTracker::new(),
            cancel,
        })
    }

    /// Queues one found resolver for validation.
    pub fn submit(&self, address: Ipv4Addr) {
        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            // Run the attempt in its own task so a panic inside it still
            // yields a terminal state.
            let attempt = tokio::spawn(attempt(ctx.clone(), address, cancel));
            let (state, protocol) = match attempt.await {
                Ok(Ok(protocol)) => (ValidationState::Success, Some(protocol)),
                Ok(Err(e)) => {
                    warn!(resolver = %address, error = %e, "validation failed");
                    (ValidationState::Failed, None)
                }
                Err(e) => {
                    error!(resolver = %address, error = %e, "validation task crashed");
                    (ValidationState::Failed, None)
                }
            };
            let _ = ctx.events.send(ValidationEvent::Finished {
                address,
                state,
                protocol,
            });
        });
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    pub fn ports(&self) -> &PortPool {
        &self.ctx.ports
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.ctx.registry
    }

    /// Waits up to `timeout` for every queued validation to finish. Returns
    /// `true` if they all did.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        time::timeout(timeout, self.tracker.wait()).await.is_ok()
    }

    /// Cancels every validation, then kills and awaits every tunnel process,
    /// all within `timeout`.
    pub async fn shutdown(self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        self.cancel.cancel();
        self.tracker.close();
        if time::timeout_at(deadline, self.tracker.wait()).await.is_err() {
            warn!(outstanding = self.tracker.len(), "validation tasks still running at shutdown");
        }
        let left = deadline.saturating_duration_since(Instant::now());
        self.ctx.registry.sweep(left).await;
        info!("validation pipeline stopped");
    }
}

async fn attempt(
    ctx: Arc<Context>,
    address: Ipv4Addr,
    cancel: CancellationToken,
) -> Result<ProxyProtocol, ValidationError> {
    if !ctx.gate.pass(&cancel).await {
        return Err(ValidationError::Cancelled);
    }
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ValidationError::Cancelled),
        p = ctx.permits.clone().acquire_owned() => p.map_err(|_| ValidationError::Cancelled)?,
    };
    if !ctx.gate.pass(&cancel).await {
        return Err(ValidationError::Cancelled);
    }
    let lease = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ValidationError::Cancelled),
        l = ctx.ports.acquire() => l.map_err(|_| ValidationError::Cancelled)?,
    };
    let port = lease.port();
    let _ = ctx.events.send(ValidationEvent::Testing(address));
    info!(resolver = %address, port, "testing tunnel");

    let args = ValidationTool::args(address, &ctx.cfg.fallback_resolver, port, &ctx.domain);
    let mut tunnel = Tunnel::spawn(ctx.tool.path(), &args, address, port)?;
    let kill = cancel.child_token();
    let _tracked = ctx.registry.track(address, tunnel.pid(), kill.clone());

    let result = tokio::select! {
        biased;
        _ = kill.cancelled() => Err(ValidationError::Cancelled),
        r = drive(&ctx, &mut tunnel) => r,
    };
    tunnel.terminate().await;
    result
}

async fn drive(ctx: &Context, tunnel: &mut Tunnel) -> Result<ProxyProtocol, ValidationError> {
    tunnel
        .wait_ready(&ctx.cfg.ready_marker, ctx.cfg.ready_timeout)
        .await?;
    // The marker can precede the listener actually accepting connections.
    time::sleep(ctx.cfg.settle_delay).await;
    tunnel.begin_protocol_probe();
    ctx.proxy.check(tunnel.port()).await
}
