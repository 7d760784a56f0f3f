//! Shadow provisioning
//!
//! Makes sure exactly one reachable shadow exists for the session: a ready
//! shadow matching the selector is reused, otherwise a new one is created and
//! polled until ready.

mod heartbeat;

pub use heartbeat::spawn_heartbeat;

use crate::cluster::{
    ClusterGateway, Readiness, ServiceSpec, ShadowEndpoint, WorkloadSpec, ANNOTATION_HEARTBEAT,
    ANNOTATION_SESSION, CONTROL_BY_VALUE, LABEL_COMPONENT, LABEL_CONTROL_BY, LABEL_ROLE,
};
use crate::common::backoff::{retry, sleep_or_cancel};
use crate::common::{Backoff, EventBus, EventKind};
use crate::config::{ConnectMethod, ShadowConfig};
use crate::{Error, Result};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ROLE_SHADOW: &str = "shadow";
const NAME_SUFFIX_LEN: usize = 5;
const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Time allowed for best-effort cleanup calls
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Labels identifying the shadow of a user and method
pub fn shadow_selector(config: &ShadowConfig, method: ConnectMethod) -> BTreeMap<String, String> {
    let mut labels = config.labels.clone();
    labels.insert(LABEL_CONTROL_BY.to_string(), CONTROL_BY_VALUE.to_string());
    labels.insert(LABEL_ROLE.to_string(), ROLE_SHADOW.to_string());
    labels.insert(LABEL_COMPONENT.to_string(), method.as_str().to_string());
    labels
}

/// `<prefix>-<5 random lowercase alphanumerics>`
pub fn random_name(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| NAME_ALPHABET[rng.gen_range(0..NAME_ALPHABET.len())] as char)
        .collect();
    format!("{}-{}", prefix, suffix)
}

pub struct ShadowProvisioner {
    gateway: Arc<dyn ClusterGateway>,
    config: ShadowConfig,
    events: EventBus,
    /// Retry policy for transient gateway failures
    policy: Backoff,
}

impl ShadowProvisioner {
    pub fn new(gateway: Arc<dyn ClusterGateway>, config: ShadowConfig, events: EventBus) -> Self {
        ShadowProvisioner {
            gateway,
            config,
            events,
            policy: Backoff::new(Duration::from_millis(200), Duration::from_secs(5), 5).with_jitter(),
        }
    }

    pub fn with_retry_policy(mut self, policy: Backoff) -> Self {
        self.policy = policy;
        self
    }

    /// Reuse or create the shadow for `selector` and wait until it is ready
    pub async fn ensure(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<ShadowEndpoint> {
        let existing = retry(&self.policy, "find shadow", cancel, || {
            self.gateway.find_workloads(namespace, selector)
        })
        .await?;

        if let Some(mut endpoint) = existing.iter().find(|e| e.is_ready()).cloned() {
            endpoint.owned = false;
            info!("Reusing shadow {}", endpoint.qualified_name());
            self.emit_ready(&endpoint, true);
            return Ok(endpoint);
        }
        if let Some(blocking) = existing.first() {
            return Err(Error::ConflictingShadow(format!(
                "{} matches but is {}",
                blocking.qualified_name(),
                blocking.readiness
            )));
        }

        let spec = self.workload_spec(namespace, selector);
        info!("Creating shadow {}/{}", namespace, spec.name);

        // a lost response followed by AlreadyExists means an earlier attempt went through
        let (gateway, spec_ref) = (&self.gateway, &spec);
        retry(&self.policy, "create shadow", cancel, || async move {
            match gateway.create_workload(spec_ref).await {
                Err(Error::Gateway(e)) if e.already_exists => {
                    debug!("Shadow {} already exists, adopting it", spec_ref.name);
                    Ok(())
                }
                other => other.map(|_| ()),
            }
        })
        .await?;

        let mut endpoint = match self.wait_ready(namespace, &spec.name, cancel).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.discard(namespace, &spec.name).await;
                return Err(e);
            }
        };
        endpoint.owned = true;

        if self.config.expose_service {
            if let Err(e) = self.expose(&endpoint, selector, cancel).await {
                self.discard(namespace, &spec.name).await;
                return Err(e);
            }
            endpoint.service = Some(endpoint.name.clone());
        }

        self.emit_ready(&endpoint, false);
        Ok(endpoint)
    }

    /// Poll until the workload is ready, the deadline passes or `cancel` fires
    pub async fn wait_ready(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<ShadowEndpoint> {
        let timeout = self.config.ready_timeout();
        let deadline = Instant::now() + timeout;
        let polling = self.config.readiness_backoff();
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempt += 1;
            match self.gateway.get_workload(namespace, name).await {
                Ok(Some(endpoint)) if endpoint.is_ready() => {
                    debug!("Shadow {} ready after {} polls", name, attempt);
                    return Ok(endpoint);
                }
                Ok(Some(endpoint)) if endpoint.readiness == Readiness::Terminating => {
                    return Err(Error::ConflictingShadow(format!(
                        "{} is terminating",
                        endpoint.qualified_name()
                    )));
                }
                Ok(_) => debug!("Shadow {} not ready yet", name),
                Err(e) if e.is_retryable() => warn!("Polling shadow {} failed: {}", name, e),
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::ProvisionTimeout(format!(
                    "{}/{} not ready after {:?}",
                    namespace, name, timeout
                )));
            }
            let pause = polling.delay(attempt).min(deadline - now);
            sleep_or_cancel(pause, cancel).await?;
        }
    }

    /// Delete an owned shadow (and its service) unless it is kept
    pub async fn release(&self, endpoint: &ShadowEndpoint) -> Result<()> {
        if !endpoint.owned {
            debug!("Shadow {} is shared, leaving it", endpoint.qualified_name());
            return Ok(());
        }
        if self.config.persist {
            info!("Keeping shadow {}", endpoint.qualified_name());
            return Ok(());
        }

        // teardown must run even after the session token fired
        let cancel = CancellationToken::new();
        if let Some(service) = &endpoint.service {
            retry(&self.policy, "delete shadow service", &cancel, || {
                self.gateway.delete_service(&endpoint.namespace, service)
            })
            .await?;
        }
        retry(&self.policy, "delete shadow", &cancel, || {
            self.gateway.delete_workload(&endpoint.namespace, &endpoint.name)
        })
        .await?;
        info!("Shadow {} deleted", endpoint.qualified_name());
        Ok(())
    }

    fn workload_spec(&self, namespace: &str, selector: &BTreeMap<String, String>) -> WorkloadSpec {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            ANNOTATION_HEARTBEAT.to_string(),
            chrono::Utc::now().timestamp().to_string(),
        );
        annotations.insert(ANNOTATION_SESSION.to_string(), self.events.session_id().to_string());
        WorkloadSpec {
            name: random_name(&self.config.name_prefix),
            namespace: namespace.to_string(),
            image: self.config.image.clone(),
            port: self.config.remote_port,
            labels: selector.clone(),
            annotations,
        }
    }

    async fn expose(
        &self,
        endpoint: &ShadowEndpoint,
        selector: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let spec = ServiceSpec {
            name: endpoint.name.clone(),
            namespace: endpoint.namespace.clone(),
            labels: selector.clone(),
            selector: selector.clone(),
            ports: vec![(self.config.remote_port, self.config.remote_port)],
        };
        let (gateway, spec) = (&self.gateway, &spec);
        retry(&self.policy, "create shadow service", cancel, || async move {
            match gateway.create_service(spec).await {
                Err(Error::Gateway(e)) if e.already_exists => Ok(()),
                other => other,
            }
        })
        .await
    }

    /// Best-effort delete of a shadow that never became usable
    async fn discard(&self, namespace: &str, name: &str) {
        if self.config.persist {
            return;
        }
        match tokio::time::timeout(CLEANUP_TIMEOUT, self.gateway.delete_workload(namespace, name)).await {
            Ok(Ok(())) => debug!("Discarded shadow {}/{}", namespace, name),
            Ok(Err(e)) => warn!("Failed to delete shadow {}/{}: {}", namespace, name, e),
            Err(_) => warn!("Timed out deleting shadow {}/{}", namespace, name),
        }
    }

    fn emit_ready(&self, endpoint: &ShadowEndpoint, reused: bool) {
        self.events.emit(EventKind::ShadowReady {
            name: endpoint.name.clone(),
            namespace: endpoint.namespace.clone(),
            pod_ip: endpoint
                .pod_ip
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            reused,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::GatewayError;
    use crate::testing::{ready_endpoint, MemoryGateway};

    fn provisioner(gateway: Arc<MemoryGateway>, config: ShadowConfig) -> ShadowProvisioner {
        ShadowProvisioner::new(gateway, config, EventBus::new("s1")).with_retry_policy(Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis(50),
            4,
        ))
    }

    fn selector() -> BTreeMap<String, String> {
        shadow_selector(&ShadowConfig::default(), ConnectMethod::Proxy)
    }

    #[test]
    fn test_random_name() {
        let name = random_name("kt-shadow");
        let suffix = name.strip_prefix("kt-shadow-").unwrap();
        assert_eq!(suffix.len(), 5);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_selector_labels() {
        let mut config = ShadowConfig::default();
        config.labels.insert("owner".into(), "alice".into());
        let labels = shadow_selector(&config, ConnectMethod::Mesh);
        assert_eq!(labels["control-by"], "kube-tunnel");
        assert_eq!(labels["kt-role"], "shadow");
        assert_eq!(labels["kt-component"], "mesh");
        assert_eq!(labels["owner"], "alice");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_creates_then_reuses() {
        let gateway = Arc::new(MemoryGateway::new());
        let provisioner = provisioner(gateway.clone(), ShadowConfig::default());
        let cancel = CancellationToken::new();

        let first = provisioner.ensure("default", &selector(), &cancel).await.unwrap();
        assert!(first.owned);
        assert!(first.is_ready());
        assert!(first.name.starts_with("kt-shadow-"));

        let second = provisioner.ensure("default", &selector(), &cancel).await.unwrap();
        assert_eq!(second.name, first.name);
        assert!(!second.owned);
        assert_eq!(gateway.creates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_created_shadow_carries_selector() {
        let gateway = Arc::new(MemoryGateway::new());
        let provisioner = provisioner(gateway.clone(), ShadowConfig::default());
        let endpoint = provisioner
            .ensure("default", &selector(), &CancellationToken::new())
            .await
            .unwrap();
        let stored = gateway.workload("default", &endpoint.name).unwrap();
        assert_eq!(stored.labels, selector());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_create_response_is_adopted() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.lose_create_response();
        let provisioner = provisioner(gateway.clone(), ShadowConfig::default());

        let endpoint = provisioner
            .ensure("default", &selector(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(gateway.creates(), 2);
        assert_eq!(gateway.workload_names(), vec![endpoint.name]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_create_failures_retried() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.fail_creates([GatewayError::transient("etcd timeout"), GatewayError::transient("etcd timeout")]);
        let provisioner = provisioner(gateway.clone(), ShadowConfig::default());

        provisioner
            .ensure("default", &selector(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(gateway.creates(), 3);
    }

    #[tokio::test]
    async fn test_permission_denied_surfaces_immediately() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.fail_creates([GatewayError::fatal("pods is forbidden")]);
        let provisioner = provisioner(gateway.clone(), ShadowConfig::default());

        let err = provisioner
            .ensure("default", &selector(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::GatewayFailure);
        assert_eq!(gateway.creates(), 1);
    }

    #[tokio::test]
    async fn test_pending_shadow_conflicts() {
        let gateway = Arc::new(MemoryGateway::new());
        let mut pending = ready_endpoint("kt-shadow-old00");
        pending.readiness = Readiness::Pending;
        pending.pod_ip = None;
        pending.labels = selector();
        gateway.insert_workload(pending);
        let provisioner = provisioner(gateway.clone(), ShadowConfig::default());

        let err = provisioner
            .ensure("default", &selector(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConflictingShadow(_)));
        assert_eq!(gateway.creates(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_timeout_discards_shadow() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.never_ready();
        let config = ShadowConfig {
            ready_timeout_secs: 5,
            ..Default::default()
        };
        let provisioner = provisioner(gateway.clone(), config);

        let err = provisioner
            .ensure("default", &selector(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProvisionTimeout(_)));
        assert!(gateway.workload_names().is_empty());
        assert_eq!(gateway.deleted_workloads().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_polling() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.never_ready();
        let provisioner = provisioner(gateway.clone(), ShadowConfig::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3500)).await;
            trigger.cancel();
        });

        let err = provisioner
            .ensure("default", &selector(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        let polls = gateway.gets();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(gateway.gets(), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expose_service_and_release() {
        let gateway = Arc::new(MemoryGateway::new());
        let config = ShadowConfig {
            expose_service: true,
            ..Default::default()
        };
        let provisioner = provisioner(gateway.clone(), config);

        let endpoint = provisioner
            .ensure("default", &selector(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(endpoint.service.as_deref(), Some(endpoint.name.as_str()));
        assert_eq!(gateway.created_services(), vec![endpoint.name.clone()]);

        provisioner.release(&endpoint).await.unwrap();
        assert_eq!(gateway.deleted_services(), vec![endpoint.name.clone()]);
        assert_eq!(gateway.deleted_workloads(), vec![endpoint.name.clone()]);
    }

    #[tokio::test]
    async fn test_release_skips_reused_and_persisted() {
        let gateway = Arc::new(MemoryGateway::new());
        let mut shared = ready_endpoint("kt-shadow-share");
        shared.owned = false;
        gateway.insert_workload(shared.clone());
        provisioner(gateway.clone(), ShadowConfig::default())
            .release(&shared)
            .await
            .unwrap();

        let owned = ready_endpoint("kt-shadow-keep0");
        gateway.insert_workload(owned.clone());
        let config = ShadowConfig {
            persist: true,
            ..Default::default()
        };
        provisioner(gateway.clone(), config).release(&owned).await.unwrap();

        assert!(gateway.deleted_workloads().is_empty());
    }
}
