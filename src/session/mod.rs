//! Session supervision
//!
//! The supervisor sequences provisioning, tunneling and routing, and owns
//! cleanup. Teardown undoes the completed stages in reverse order (routing,
//! then transport, then the owned shadow) and runs exactly once, whether it
//! is triggered by a failed start, a signal or a lost tunnel.

mod lock;

pub use lock::{SessionGuard, SessionLock};

use crate::cluster::{CidrResolver, ClusterGateway, ShadowEndpoint};
use crate::common::{EventBus, EventKind, Stage};
use crate::config::{Config, ConnectMethod};
use crate::connect::{service_names, strategy_for, ConnectionStrategy, RoutingPlan};
use crate::shadow::{shadow_selector, spawn_heartbeat, ShadowProvisioner};
use crate::system::SystemHooks;
use crate::transport::{ForwardBackend, TunnelSession, TunnelTransport};
use crate::{Error, Result};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Provisioning,
    Tunneling,
    RoutingActive,
    ShuttingDown,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Provisioning => write!(f, "provisioning"),
            SessionState::Tunneling => write!(f, "tunneling"),
            SessionState::RoutingActive => write!(f, "routing-active"),
            SessionState::ShuttingDown => write!(f, "shutting-down"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// What a started session holds, released in reverse
#[derive(Default)]
struct Resources {
    guard: Option<SessionGuard>,
    shadow: Option<ShadowEndpoint>,
    heartbeat: Option<JoinHandle<()>>,
    tunnel: Option<TunnelSession>,
    strategy: Option<Box<dyn ConnectionStrategy>>,
}

/// Collaborators of a session
pub struct SessionDeps {
    pub gateway: Arc<dyn ClusterGateway>,
    pub backend: Arc<dyn ForwardBackend>,
    pub hooks: SystemHooks,
    pub lock: Arc<SessionLock>,
}

pub struct SessionSupervisor {
    config: Config,
    gateway: Arc<dyn ClusterGateway>,
    hooks: SystemHooks,
    lock: Arc<SessionLock>,
    events: EventBus,
    provisioner: ShadowProvisioner,
    transport: TunnelTransport,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
    resources: Mutex<Resources>,
    teardown_started: AtomicBool,
    teardown_done: watch::Sender<bool>,
}

impl SessionSupervisor {
    pub fn new(config: Config, deps: SessionDeps, events: EventBus) -> Self {
        let provisioner =
            ShadowProvisioner::new(deps.gateway.clone(), config.shadow.clone(), events.clone());
        let transport = TunnelTransport::new(deps.backend, config.transport.backoff(), events.clone());
        let (state, _) = watch::channel(SessionState::Idle);
        let (teardown_done, _) = watch::channel(false);
        SessionSupervisor {
            config,
            gateway: deps.gateway,
            hooks: deps.hooks,
            lock: deps.lock,
            events,
            provisioner,
            transport,
            cancel: CancellationToken::new(),
            state,
            resources: Mutex::new(Resources::default()),
            teardown_started: AtomicBool::new(false),
            teardown_done,
        }
    }

    pub fn session_id(&self) -> &str {
        self.events.session_id()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Token interrupting every wait of this session
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The open tunnel, once the session reached the tunneling stage
    pub async fn tunnel(&self) -> Option<TunnelSession> {
        self.resources.lock().await.tunnel.clone()
    }

    /// Bring the session up: provisioning, tunneling, routing.
    ///
    /// On failure the completed stages are torn down and the error is
    /// returned annotated with the stage it came from.
    pub async fn start(&self) -> Result<()> {
        if self.teardown_started.load(Ordering::Acquire) {
            return Err(Error::internal("session was already shut down"));
        }
        let guard = self.lock.try_acquire()?;

        let result = {
            let mut resources = self.resources.lock().await;
            resources.guard = Some(guard);
            self.bring_up(&mut resources).await
        };

        match result {
            Ok(()) => {
                self.state.send_replace(SessionState::RoutingActive);
                info!("Session {} active ({})", self.session_id(), self.config.method);
                Ok(())
            }
            Err(e) => {
                error!("Session {} failed: {}", self.session_id(), e);
                self.state.send_replace(SessionState::Failed);
                self.teardown(Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn bring_up(&self, resources: &mut Resources) -> Result<()> {
        let namespace = self.config.namespace.as_str();

        self.state.send_replace(SessionState::Provisioning);
        let selector = shadow_selector(&self.config.shadow, self.config.method);
        let shadow = self
            .provisioner
            .ensure(namespace, &selector, &self.cancel)
            .await
            .map_err(|e| e.at_stage(Stage::Provisioning))?;
        if let Some(interval) = self.config.shadow.heartbeat_interval() {
            resources.heartbeat = Some(spawn_heartbeat(
                self.gateway.clone(),
                &shadow,
                interval,
                self.cancel.child_token(),
            ));
        }
        resources.shadow = Some(shadow.clone());

        self.state.send_replace(SessionState::Tunneling);
        let tunnel = self
            .transport
            .open(
                &shadow,
                self.config.shadow.remote_port,
                self.config.transport.local_port,
                &self.cancel,
            )
            .await
            .map_err(|e| e.at_stage(Stage::Tunneling))?;
        resources.tunnel = Some(tunnel.clone());

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled.at_stage(Stage::Routing));
        }
        let plan = self
            .plan(&tunnel)
            .await
            .map_err(|e| e.at_stage(Stage::Routing))?;
        let mut strategy = strategy_for(&self.config, &self.hooks, self.session_id());
        let entries = strategy
            .activate(&tunnel, &plan)
            .await
            .map_err(|e| e.at_stage(Stage::Routing))?;
        resources.strategy = Some(strategy);
        self.events.emit(EventKind::RoutingActivated {
            method: self.config.method.to_string(),
            entries,
        });
        Ok(())
    }

    /// Compute the routing plan of the configured method
    async fn plan(&self, tunnel: &TunnelSession) -> Result<RoutingPlan> {
        let namespace = self.config.namespace.as_str();
        let namespaces = if self.config.mesh.namespaces.is_empty() {
            vec![namespace.to_string()]
        } else {
            self.config.mesh.namespaces.clone()
        };
        let domain = self.config.mesh.cluster_domain.as_str();

        match self.config.method {
            ConnectMethod::Proxy => {
                let mut plan = RoutingPlan::proxy(tunnel, self.config.proxy.bypass.clone());
                if self.config.proxy.dump_hosts {
                    let names =
                        service_names(self.gateway.as_ref(), &namespaces, namespace, domain, None)
                            .await?;
                    if let RoutingPlan::Proxy { hosts, .. } = &mut plan {
                        *hosts = names.into_iter().map(|n| n.entry).collect();
                    }
                }
                Ok(plan)
            }
            ConnectMethod::FullTunnel | ConnectMethod::Mesh => {
                let resolver = CidrResolver::new(
                    self.gateway.clone(),
                    self.config.cidr.clone(),
                    self.cancel.child_token(),
                );
                let cidrs = resolver
                    .resolve(namespace, &self.config.cidr.include_ranges()?)
                    .await?;
                if self.config.method == ConnectMethod::FullTunnel {
                    return Ok(RoutingPlan::routes(cidrs));
                }
                let services = service_names(
                    self.gateway.as_ref(),
                    &namespaces,
                    namespace,
                    domain,
                    Some(&cidrs),
                )
                .await?;
                Ok(RoutingPlan::Routes { cidrs, services })
            }
        }
    }

    /// Tear the session down; concurrent and repeated calls wait for the one teardown
    pub async fn shutdown(&self) {
        if self.state() != SessionState::RoutingActive {
            // interrupt a start still in progress
            self.cancel.cancel();
        }
        self.teardown(None).await;
    }

    /// Start, then hold the session until `signal` resolves or the tunnel is lost.
    ///
    /// Returns `TunnelLost` (annotated with the tunneling stage) in the latter case.
    pub async fn run<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(signal);

        let start = self.start();
        tokio::pin!(start);
        let early = tokio::select! {
            res = &mut start => Some(res),
            _ = &mut signal => None,
        };
        let interrupted = early.is_none();
        match early {
            Some(res) => res?,
            None => {
                info!("Interrupted while starting");
                self.cancel.cancel();
                start.await?;
            }
        }
        if interrupted {
            self.shutdown().await;
            return Ok(());
        }

        let tunnel = self
            .tunnel()
            .await
            .ok_or_else(|| Error::internal("active session without tunnel"))?;

        tokio::select! {
            _ = &mut signal => {
                info!("Shutting down session {}", self.session_id());
                self.shutdown().await;
                Ok(())
            }
            reason = tunnel.lost() => {
                self.teardown(Some(format!("tunnel lost: {}", reason))).await;
                Err(Error::TunnelLost(reason).at_stage(Stage::Tunneling))
            }
        }
    }

    async fn teardown(&self, cause: Option<String>) {
        if self.teardown_started.swap(true, Ordering::AcqRel) {
            let mut done = self.teardown_done.subscribe();
            let _ = done.wait_for(|finished| *finished).await;
            return;
        }

        let failed = cause.is_some() || self.state() == SessionState::Failed;
        self.state.send_replace(SessionState::ShuttingDown);
        let mut resources = self.resources.lock().await;

        if let Some(mut strategy) = resources.strategy.take() {
            debug!("Deactivating {} routing", strategy.method());
            if let Err(e) = strategy.deactivate().await {
                warn!("Failed to revert routing: {}", e);
            }
        }

        self.cancel.cancel();

        if let Some(tunnel) = resources.tunnel.take() {
            self.transport.close(&tunnel).await;
        }
        if let Some(heartbeat) = resources.heartbeat.take() {
            if let Err(e) = heartbeat.await {
                warn!("Heartbeat task ended abnormally: {}", e);
            }
        }
        if let Some(shadow) = resources.shadow.take() {
            if let Err(e) = self.provisioner.release(&shadow).await {
                warn!("Failed to release shadow {}: {}", shadow.qualified_name(), e);
            }
        }
        resources.guard.take();
        drop(resources);

        self.state.send_replace(if failed {
            SessionState::Failed
        } else {
            SessionState::Idle
        });
        self.events.emit(EventKind::SessionTornDown { cause });
        info!("Session {} torn down", self.session_id());
        self.teardown_done.send_replace(true);
    }
}
