//! In-process port-forward over the API server
//!
//! Accepts local connections and opens one port-forward stream per
//! connection. A periodic probe of the shadow pod detects a tunnel whose
//! remote end is gone even when no connection is active.

use super::{ForwardBackend, ForwardHandle};
use crate::cluster::ShadowEndpoint;
use crate::common::net::{bind_local, configure_tcp_stream};
use crate::config::TransportKind;
use crate::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive failed probes before the forward is considered closed
const MAX_PROBE_FAILURES: u32 = 3;

/// Port-forward through the `kube` client
pub struct PortForwardBackend {
    client: Client,
    probe_interval: Duration,
}

impl PortForwardBackend {
    pub fn new(client: Client, probe_interval: Duration) -> Self {
        PortForwardBackend {
            client,
            probe_interval,
        }
    }
}

#[async_trait]
impl ForwardBackend for PortForwardBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    async fn open(
        &self,
        endpoint: &ShadowEndpoint,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Box<dyn ForwardHandle>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &endpoint.namespace);
        probe_pod(&pods, &endpoint.name).await.map_err(Error::tunnel_lost)?;

        let listener = bind_local(local_port).await?;
        let cancel = CancellationToken::new();
        let (closed_tx, closed_rx) = oneshot::channel();

        let forward = Forward {
            pods,
            pod: endpoint.name.clone(),
            remote_port,
            probe_interval: self.probe_interval,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(async move {
            let reason = forward.serve(listener).await;
            let _ = closed_tx.send(reason);
        });

        debug!("Forwarding 127.0.0.1:{} to {}:{}", local_port, endpoint.name, remote_port);
        Ok(Box::new(PortForwardHandle {
            cancel,
            closed: Some(closed_rx),
            task: Some(task),
        }))
    }
}

struct Forward {
    pods: Api<Pod>,
    pod: String,
    remote_port: u16,
    probe_interval: Duration,
    cancel: CancellationToken,
}

impl Forward {
    /// Serve until cancelled or the pod stops answering; returns the reason
    async fn serve(self, listener: TcpListener) -> String {
        let mut probe = tokio::time::interval(self.probe_interval);
        probe.tick().await;
        let mut probe_failures = 0u32;
        let connections = CancellationToken::new();
        let _guard = connections.clone().drop_guard();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return "closed".to_string(),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted {} for {}", peer, self.pod);
                        configure_tcp_stream(&stream);
                        let pods = self.pods.clone();
                        let pod = self.pod.clone();
                        let port = self.remote_port;
                        let stop = connections.child_token();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = stop.cancelled() => {}
                                res = forward_connection(pods, &pod, port, stream) => {
                                    if let Err(e) = res {
                                        warn!("Forward of {} to {}:{} failed: {}", peer, pod, port, e);
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => return format!("local listener failed: {}", e),
                },
                _ = probe.tick() => match probe_pod(&self.pods, &self.pod).await {
                    Ok(()) => probe_failures = 0,
                    Err(reason) => {
                        probe_failures += 1;
                        debug!("Probe of {} failed ({}): {}", self.pod, probe_failures, reason);
                        if probe_failures >= MAX_PROBE_FAILURES {
                            return reason;
                        }
                    }
                },
            }
        }
    }
}

async fn forward_connection(pods: Api<Pod>, pod: &str, port: u16, mut client: TcpStream) -> Result<()> {
    let mut forwarder = pods.portforward(pod, &[port]).await?;
    let mut upstream = forwarder
        .take_stream(port)
        .ok_or_else(|| Error::tunnel_lost(format!("no stream for port {} of {}", port, pod)))?;
    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    debug!("Connection to {}:{} finished ({} up, {} down)", pod, port, sent, received);
    drop(upstream);
    forwarder
        .join()
        .await
        .map_err(|e| Error::tunnel_lost(format!("port-forward to {} ended: {}", pod, e)))
}

/// Check that the shadow pod is still running
async fn probe_pod(pods: &Api<Pod>, name: &str) -> std::result::Result<(), String> {
    let pod = match pods.get_opt(name).await {
        Ok(Some(pod)) => pod,
        Ok(None) => return Err(format!("pod {} no longer exists", name)),
        Err(e) => return Err(format!("cannot read pod {}: {}", name, e)),
    };
    if pod.metadata.deletion_timestamp.is_some() {
        return Err(format!("pod {} is terminating", name));
    }
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown");
    if phase != "Running" {
        return Err(format!("pod {} is {}", name, phase));
    }
    Ok(())
}

struct PortForwardHandle {
    cancel: CancellationToken,
    closed: Option<oneshot::Receiver<String>>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl ForwardHandle for PortForwardHandle {
    async fn closed(&mut self) -> String {
        match self.closed.as_mut() {
            Some(rx) => {
                let reason = rx.await.unwrap_or_else(|_| "forward task ended".to_string());
                self.closed = None;
                reason
            }
            None => std::future::pending().await,
        }
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Port-forward task ended abnormally: {}", e);
            }
            info!("Port-forward stopped");
        }
    }
}
