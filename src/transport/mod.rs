//! Tunnel transport
//!
//! A [`TunnelSession`] binds a local port to a port inside the shadow. The
//! bytes are carried by a [`ForwardBackend`]: the in-process port-forward
//! ([`PortForwardBackend`]) or a delegated `kubectl port-forward`
//! ([`KubectlBackend`]).
//!
//! Every session is driven by one supervising task which reopens the
//! backend with backoff when it closes unexpectedly, and declares the tunnel
//! lost once the retry budget is spent.

mod kubectl;
mod port_forward;

pub use kubectl::KubectlBackend;
pub use port_forward::PortForwardBackend;

use crate::cluster::ShadowEndpoint;
use crate::common::backoff::or_cancel;
use crate::common::net::PortLease;
use crate::common::{Backoff, EventBus, EventKind};
use crate::config::{TransportConfig, TransportKind};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Opens forwards from a local port to a port of the shadow
#[async_trait]
pub trait ForwardBackend: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Start forwarding `127.0.0.1:local_port` to `endpoint:remote_port`.
    ///
    /// Returns once the local port serves traffic.
    async fn open(
        &self,
        endpoint: &ShadowEndpoint,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Box<dyn ForwardHandle>>;
}

/// A running forward
#[async_trait]
pub trait ForwardHandle: Send {
    /// Resolves when the forward stops carrying traffic, with the reason
    async fn closed(&mut self) -> String;

    /// Stop forwarding and release the local port; safe to call repeatedly
    async fn shutdown(&mut self);
}

/// Build the backend selected by the configuration
pub fn backend_for(
    config: &TransportConfig,
    context: Option<&str>,
    client: kube::Client,
) -> Arc<dyn ForwardBackend> {
    match config.kind {
        TransportKind::Direct => Arc::new(PortForwardBackend::new(client, config.probe_interval())),
        TransportKind::Kubectl => Arc::new(
            KubectlBackend::new(config.kubectl.clone(), config.probe_interval())
                .with_context(context.map(str::to_string)),
        ),
    }
}

/// Observable state of a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelStatus {
    Connecting,
    Established,
    Reconnecting { attempt: u32 },
    /// Retry budget spent or a fatal error
    Lost(String),
    /// Closed on request
    Closed,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStatus::Connecting => write!(f, "connecting"),
            TunnelStatus::Established => write!(f, "established"),
            TunnelStatus::Reconnecting { attempt } => write!(f, "reconnecting({})", attempt),
            TunnelStatus::Lost(reason) => write!(f, "lost: {}", reason),
            TunnelStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Opens and closes tunnel sessions over one backend
pub struct TunnelTransport {
    backend: Arc<dyn ForwardBackend>,
    policy: Backoff,
    events: EventBus,
}

impl TunnelTransport {
    pub fn new(backend: Arc<dyn ForwardBackend>, policy: Backoff, events: EventBus) -> Self {
        TunnelTransport {
            backend,
            policy,
            events,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.backend.kind()
    }

    /// Open a tunnel to a ready endpoint.
    ///
    /// Returns after the first successful establishment, or with the error
    /// that ended the attempts (`TunnelLost` once the budget is spent,
    /// `PortUnavailable`, `Cancelled`).
    pub async fn open(
        &self,
        endpoint: &ShadowEndpoint,
        remote_port: u16,
        local_port: u16,
        cancel: &CancellationToken,
    ) -> Result<TunnelSession> {
        if !endpoint.is_ready() {
            return Err(Error::ConflictingShadow(format!(
                "{} is {}, not ready for a tunnel",
                endpoint.qualified_name(),
                endpoint.readiness
            )));
        }

        let lease = PortLease::acquire(local_port)?;
        let (status_tx, mut status_rx) = watch::channel(TunnelStatus::Connecting);
        let inner = Arc::new(TunnelInner {
            endpoint: endpoint.clone(),
            kind: self.backend.kind(),
            local_port,
            remote_port,
            alive: AtomicBool::new(false),
            status: status_rx.clone(),
            failure: SyncMutex::new(None),
            cancel: cancel.child_token(),
            task: Mutex::new(None),
            lease: SyncMutex::new(Some(lease)),
        });

        let supervisor = Supervisor {
            backend: self.backend.clone(),
            policy: self.policy.clone(),
            events: self.events.clone(),
            inner: inner.clone(),
            status: status_tx,
        };
        *inner.task.lock().await = Some(tokio::spawn(supervisor.run()));

        let session = TunnelSession { inner };
        loop {
            let status = status_rx.borrow_and_update().clone();
            match status {
                TunnelStatus::Established => return Ok(session),
                TunnelStatus::Lost(_) | TunnelStatus::Closed => {
                    let err = session.take_failure().unwrap_or(Error::Cancelled);
                    session.close().await;
                    return Err(err);
                }
                _ => {}
            }
            if status_rx.changed().await.is_err() {
                let err = session.take_failure().unwrap_or(Error::Cancelled);
                session.close().await;
                return Err(err);
            }
        }
    }

    /// Close a session; idempotent
    pub async fn close(&self, session: &TunnelSession) {
        session.close().await;
    }
}

struct TunnelInner {
    endpoint: ShadowEndpoint,
    kind: TransportKind,
    local_port: u16,
    remote_port: u16,
    alive: AtomicBool,
    status: watch::Receiver<TunnelStatus>,
    /// Error that ended the supervisor, reported by `open`
    failure: SyncMutex<Option<Error>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    lease: SyncMutex<Option<PortLease>>,
}

/// Handle to an open tunnel; clones share the same tunnel
#[derive(Clone)]
pub struct TunnelSession {
    inner: Arc<TunnelInner>,
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("endpoint", &self.inner.endpoint.qualified_name())
            .field("kind", &self.inner.kind)
            .field("local_port", &self.inner.local_port)
            .field("remote_port", &self.inner.remote_port)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl TunnelSession {
    pub fn endpoint(&self) -> &ShadowEndpoint {
        &self.inner.endpoint
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.kind
    }

    pub fn local_port(&self) -> u16 {
        self.inner.local_port
    }

    pub fn remote_port(&self) -> u16 {
        self.inner.remote_port
    }

    /// Whether the forward currently carries traffic
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    pub fn status(&self) -> TunnelStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.inner.status.clone()
    }

    /// Wait until the tunnel is declared lost and return the reason.
    ///
    /// Never resolves for a tunnel that is closed on request.
    pub async fn lost(&self) -> String {
        let mut rx = self.subscribe();
        loop {
            if let TunnelStatus::Lost(reason) = &*rx.borrow_and_update() {
                return reason.clone();
            }
            if rx.changed().await.is_err() {
                if let TunnelStatus::Lost(reason) = &*rx.borrow() {
                    return reason.clone();
                }
                return std::future::pending().await;
            }
        }
    }

    /// Stop the supervisor and the forward, then release the local port.
    ///
    /// Concurrent callers wait for the same close.
    pub async fn close(&self) {
        let mut task = self.inner.task.lock().await;
        self.inner.cancel.cancel();
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                warn!("Tunnel supervisor for {} ended abnormally: {}", self.inner.endpoint.name, e);
            }
            info!(
                "Tunnel 127.0.0.1:{} -> {}:{} closed",
                self.inner.local_port, self.inner.endpoint.name, self.inner.remote_port
            );
        }
        self.inner.alive.store(false, Ordering::Release);
        self.inner.lease.lock().take();
    }

    fn take_failure(&self) -> Option<Error> {
        self.inner.failure.lock().take()
    }
}

/// Supervising task of one tunnel
struct Supervisor {
    backend: Arc<dyn ForwardBackend>,
    policy: Backoff,
    events: EventBus,
    inner: Arc<TunnelInner>,
    status: watch::Sender<TunnelStatus>,
}

impl Supervisor {
    async fn run(self) {
        let inner = &self.inner;
        let pod = inner.endpoint.name.clone();
        let cancel = inner.cancel.clone();
        let mut failures = 0u32;
        let mut established = false;

        loop {
            let reason = match or_cancel(
                &cancel,
                self.backend
                    .open(&inner.endpoint, inner.remote_port, inner.local_port),
            )
            .await
            {
                Ok(mut handle) => {
                    failures = 0;
                    established = true;
                    inner.alive.store(true, Ordering::Release);
                    self.status.send_replace(TunnelStatus::Established);
                    info!(
                        "Tunnel 127.0.0.1:{} -> {}:{} established ({})",
                        inner.local_port, pod, inner.remote_port, inner.kind
                    );
                    self.events.emit(EventKind::TunnelEstablished {
                        pod: pod.clone(),
                        local_port: inner.local_port,
                        remote_port: inner.remote_port,
                    });

                    let closed = tokio::select! {
                        _ = cancel.cancelled() => None,
                        reason = handle.closed() => Some(reason),
                    };
                    handle.shutdown().await;
                    inner.alive.store(false, Ordering::Release);
                    match closed {
                        Some(reason) => {
                            warn!("Tunnel to {} closed unexpectedly: {}", pod, reason);
                            reason
                        }
                        None => break,
                    }
                }
                Err(Error::Cancelled) => break,
                Err(e @ Error::PortUnavailable(_)) => {
                    // a first open reports the error to the caller instead
                    warn!("Tunnel to {} cannot reopen: {}", pod, e);
                    self.fail(e, established);
                    return;
                }
                Err(e) => {
                    debug!("Opening tunnel to {} failed: {}", pod, e);
                    e.to_string()
                }
            };

            failures += 1;
            if !self.policy.allows(failures) {
                warn!("Tunnel to {} lost after {} attempts: {}", pod, failures, reason);
                self.fail(Error::TunnelLost(reason), true);
                return;
            }

            self.status
                .send_replace(TunnelStatus::Reconnecting { attempt: failures });
            self.events.emit(EventKind::TunnelReconnecting {
                pod: pod.clone(),
                attempt: failures,
                max_attempts: self.policy.max_attempts,
            });
            if self.policy.sleep(failures, &cancel).await.is_err() {
                break;
            }
        }

        self.status.send_replace(TunnelStatus::Closed);
    }

    /// Give up on the tunnel, reporting `TunnelLost` when `report` is set
    fn fail(&self, err: Error, report: bool) {
        let reason = match &err {
            Error::TunnelLost(reason) => reason.clone(),
            other => other.to_string(),
        };
        if report {
            self.events.emit(EventKind::TunnelLost {
                pod: self.inner.endpoint.name.clone(),
                reason: reason.clone(),
            });
        }
        *self.inner.failure.lock() = Some(err);
        self.status.send_replace(TunnelStatus::Lost(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Readiness;
    use crate::testing::{ready_endpoint, ScriptedBackend};
    use std::time::Duration;

    fn policy(max: u32) -> Backoff {
        Backoff::new(Duration::from_millis(100), Duration::from_secs(1), max)
    }

    fn names(rx: &mut tokio::sync::broadcast::Receiver<crate::SessionEvent>) -> Vec<&'static str> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event.kind.name());
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_after_two_failures() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.fail_next(2);
        let events = EventBus::new("t");
        let mut rx = events.subscribe();
        let transport = TunnelTransport::new(backend.clone(), policy(5), events);

        let session = transport
            .open(&ready_endpoint("shadow-a"), 1080, 42001, &CancellationToken::new())
            .await
            .unwrap();
        assert!(session.is_alive());
        assert_eq!(backend.opens(), 3);
        assert_eq!(
            names(&mut rx),
            vec!["TunnelReconnecting", "TunnelReconnecting", "TunnelEstablished"]
        );
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_budget_exhausted() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.fail_next(10);
        let events = EventBus::new("t");
        let mut rx = events.subscribe();
        let transport = TunnelTransport::new(backend.clone(), policy(3), events);

        let err = transport
            .open(&ready_endpoint("shadow-a"), 1080, 42002, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TunnelLost(_)));
        assert_eq!(backend.opens(), 3);
        assert_eq!(
            names(&mut rx),
            vec!["TunnelReconnecting", "TunnelReconnecting", "TunnelLost"]
        );
        // the port is free again
        drop(PortLease::acquire(42002).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_drop() {
        let backend = Arc::new(ScriptedBackend::new());
        let events = EventBus::new("t");
        let mut rx = events.subscribe();
        let transport = TunnelTransport::new(backend.clone(), policy(5), events);

        let session = transport
            .open(&ready_endpoint("shadow-a"), 1080, 42003, &CancellationToken::new())
            .await
            .unwrap();
        let mut status = session.subscribe();
        status.borrow_and_update();

        backend.drop_current("pod restarted");
        loop {
            status.changed().await.unwrap();
            if *status.borrow() == TunnelStatus::Established {
                break;
            }
        }
        assert_eq!(backend.opens(), 2);
        assert_eq!(
            names(&mut rx),
            vec!["TunnelEstablished", "TunnelReconnecting", "TunnelEstablished"]
        );
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_after_repeated_drops() {
        let backend = Arc::new(ScriptedBackend::new());
        let transport = TunnelTransport::new(backend.clone(), policy(1), EventBus::new("t"));
        let session = transport
            .open(&ready_endpoint("shadow-a"), 1080, 42004, &CancellationToken::new())
            .await
            .unwrap();

        backend.drop_current("connection reset");
        let reason = session.lost().await;
        assert_eq!(reason, "connection reset");
        assert!(!session.is_alive());
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_taken_on_reconnect_reports_lost() {
        let backend = Arc::new(ScriptedBackend::new());
        let events = EventBus::new("t");
        let mut rx = events.subscribe();
        let transport = TunnelTransport::new(backend.clone(), policy(5), events);
        let session = transport
            .open(&ready_endpoint("shadow-a"), 1080, 42010, &CancellationToken::new())
            .await
            .unwrap();

        backend.refuse_port();
        backend.drop_current("pod restarted");
        let reason = session.lost().await;
        assert!(reason.contains("42010"), "{}", reason);
        assert_eq!(backend.opens(), 2);

        let events = names(&mut rx);
        assert_eq!(events.last(), Some(&"TunnelLost"));
        assert_eq!(events.iter().filter(|e| **e == "TunnelLost").count(), 1);
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drops_within_budget_keep_tunnel() {
        let backend = Arc::new(ScriptedBackend::new());
        let events = EventBus::new("t");
        let mut rx = events.subscribe();
        let transport = TunnelTransport::new(backend.clone(), policy(5), events);
        let session = transport
            .open(&ready_endpoint("shadow-a"), 1080, 42011, &CancellationToken::new())
            .await
            .unwrap();
        let mut status = session.subscribe();

        for reason in ["pod restarted", "connection reset"] {
            status.borrow_and_update();
            backend.drop_current(reason);
            loop {
                status.changed().await.unwrap();
                if *status.borrow() == TunnelStatus::Established {
                    break;
                }
            }
        }

        assert!(session.is_alive());
        assert_eq!(backend.opens(), 3);
        let events = names(&mut rx);
        assert_eq!(events.iter().filter(|e| **e == "TunnelReconnecting").count(), 2);
        assert!(!events.contains(&"TunnelLost"));
        session.close().await;
    }

    #[tokio::test]
    async fn test_open_requires_ready_endpoint() {
        let backend = Arc::new(ScriptedBackend::new());
        let transport = TunnelTransport::new(backend.clone(), policy(3), EventBus::new("t"));
        let mut endpoint = ready_endpoint("shadow-a");
        endpoint.readiness = Readiness::Pending;

        let err = transport
            .open(&endpoint, 1080, 42005, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConflictingShadow(_)));
        assert_eq!(backend.opens(), 0);
    }

    #[tokio::test]
    async fn test_port_registered_twice() {
        let backend = Arc::new(ScriptedBackend::new());
        let transport = TunnelTransport::new(backend.clone(), policy(3), EventBus::new("t"));
        let cancel = CancellationToken::new();
        let first = transport
            .open(&ready_endpoint("shadow-a"), 1080, 42006, &cancel)
            .await
            .unwrap();

        let err = transport
            .open(&ready_endpoint("shadow-b"), 1080, 42006, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PortUnavailable(42006)));

        first.close().await;
        let second = transport
            .open(&ready_endpoint("shadow-b"), 1080, 42006, &cancel)
            .await
            .unwrap();
        second.close().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_not_retried() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.refuse_port();
        let transport = TunnelTransport::new(backend.clone(), policy(5), EventBus::new("t"));
        let err = transport
            .open(&ready_endpoint("shadow-a"), 1080, 42007, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PortUnavailable(42007)));
        assert_eq!(backend.opens(), 1);
    }

    #[tokio::test]
    async fn test_close_idempotent_and_concurrent() {
        let backend = Arc::new(ScriptedBackend::new());
        let transport = TunnelTransport::new(backend.clone(), policy(3), EventBus::new("t"));
        let session = transport
            .open(&ready_endpoint("shadow-a"), 1080, 42008, &CancellationToken::new())
            .await
            .unwrap();

        let (a, b) = (session.clone(), session.clone());
        tokio::join!(a.close(), b.close());
        transport.close(&session).await;
        assert_eq!(session.status(), TunnelStatus::Closed);
        assert_eq!(backend.shutdowns(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retry() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.fail_next(100);
        let transport = TunnelTransport::new(backend.clone(), policy(0), EventBus::new("t"));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });
        let err = transport
            .open(&ready_endpoint("shadow-a"), 1080, 42009, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
