//! Delegated `kubectl port-forward`

use super::{ForwardBackend, ForwardHandle};
use crate::cluster::ShadowEndpoint;
use crate::common::net::{ensure_port_free, port_accepting};
use crate::common::process::{ManagedProcess, ProcessSpec};
use crate::config::TransportKind;
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Time allowed for kubectl to start listening
const LISTEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Forward through a `kubectl port-forward` child process.
///
/// Liveness is the process being alive and the local port accepting.
pub struct KubectlBackend {
    kubectl: String,
    probe_interval: Duration,
    context: Option<String>,
}

impl KubectlBackend {
    pub fn new(kubectl: impl Into<String>, probe_interval: Duration) -> Self {
        KubectlBackend {
            kubectl: kubectl.into(),
            probe_interval,
            context: None,
        }
    }

    /// Pass `--context` to every invocation
    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    fn command(&self, endpoint: &ShadowEndpoint, remote_port: u16, local_port: u16) -> ProcessSpec {
        let mut spec = ProcessSpec::new(&self.kubectl).without_proxy_env();
        if let Some(context) = &self.context {
            spec = spec.arg("--context").arg(context);
        }
        spec.arg("port-forward")
            .arg(format!("pod/{}", endpoint.name))
            .arg(format!("{}:{}", local_port, remote_port))
            .arg("-n")
            .arg(&endpoint.namespace)
            .arg("--address")
            .arg("127.0.0.1")
    }
}

#[async_trait]
impl ForwardBackend for KubectlBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Kubectl
    }

    async fn open(
        &self,
        endpoint: &ShadowEndpoint,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Box<dyn ForwardHandle>> {
        ensure_port_free(local_port).await?;

        let process = ManagedProcess::spawn(self.command(endpoint, remote_port, local_port)).await?;

        let deadline = tokio::time::Instant::now() + LISTEN_TIMEOUT;
        while !port_accepting(local_port, Duration::from_millis(500)).await {
            if !process.is_alive().await || tokio::time::Instant::now() >= deadline {
                let tail = process.output_tail();
                process.stop().await;
                return Err(Error::process(format!(
                    "kubectl port-forward to {} did not start listening: {}",
                    endpoint.name, tail
                )));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        debug!("kubectl forwarding 127.0.0.1:{} to {}:{}", local_port, endpoint.name, remote_port);
        Ok(Box::new(KubectlHandle {
            process,
            local_port,
            probe_interval: self.probe_interval,
        }))
    }
}

struct KubectlHandle {
    process: ManagedProcess,
    local_port: u16,
    probe_interval: Duration,
}

#[async_trait]
impl ForwardHandle for KubectlHandle {
    async fn closed(&mut self) -> String {
        let mut probe = tokio::time::interval(self.probe_interval);
        probe.tick().await;
        loop {
            tokio::select! {
                status = self.process.wait_exit() => {
                    return match status {
                        Some(status) => format!("kubectl exited with {}: {}", status, self.process.output_tail()),
                        None => "kubectl stopped".to_string(),
                    };
                }
                _ = probe.tick() => {
                    if !port_accepting(self.local_port, Duration::from_secs(2)).await {
                        return format!("local port {} stopped accepting", self.local_port);
                    }
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        self.process.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ready_endpoint;

    #[test]
    fn test_kubectl_command_line() {
        let backend = KubectlBackend::new("kubectl", Duration::from_secs(30))
            .with_context(Some("staging".to_string()));
        let spec = backend.command(&ready_endpoint("kt-shadow-abcde"), 1080, 2223);
        assert_eq!(
            spec.display(),
            "kubectl --context staging port-forward pod/kt-shadow-abcde 2223:1080 -n default --address 127.0.0.1"
        );
        // kubectl must reach the API server directly, never through the tunnel
        for key in crate::common::process::PROXY_ENV_KEYS {
            assert!(spec.env_removed.iter().any(|k| k == key), "{}", key);
        }
    }

    #[tokio::test]
    async fn test_missing_kubectl() {
        let backend = KubectlBackend::new("/nonexistent/kubectl", Duration::from_secs(30));
        let result = backend.open(&ready_endpoint("kt-shadow-abcde"), 1080, 42101).await;
        assert!(matches!(result, Err(Error::Process(_))));
    }
}
