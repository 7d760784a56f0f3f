//! Kubernetes API implementation of the gateway

use super::{
    ClusterGateway, Readiness, ServiceRecord, ServiceSpec, ShadowEndpoint, WorkloadSpec,
    ANNOTATION_HEARTBEAT,
};
use crate::config::format_selector;
use crate::{Error, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Node, Pod, PodSpec, Service, ServicePort,
    ServiceSpec as K8sServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// Gateway backed by a `kube` client
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self {
        KubeGateway { client }
    }

    /// Connect using the local kubeconfig, optionally selecting a context
    pub async fn connect(context: Option<&str>) -> Result<Self> {
        let client = match context {
            None => Client::try_default().await?,
            Some(ctx) => {
                let kubeconfig = Kubeconfig::read()
                    .map_err(|e| Error::config(format!("Failed to read kubeconfig: {}", e)))?;
                let options = KubeConfigOptions {
                    context: Some(ctx.to_string()),
                    ..Default::default()
                };
                let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| Error::config(format!("Invalid context {}: {}", ctx, e)))?;
                Client::try_from(config)?
            }
        };
        info!("Connected to cluster (context: {})", context.unwrap_or("current"));
        Ok(KubeGateway { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }
}

/// Convert a pod into a shadow endpoint, reading readiness from its status
fn endpoint_from_pod(pod: &Pod) -> ShadowEndpoint {
    let meta = &pod.metadata;
    let status = pod.status.as_ref();

    let pod_ip = status
        .and_then(|s| s.pod_ip.as_deref())
        .and_then(|ip| ip.parse::<IpAddr>().ok());

    let running = status.and_then(|s| s.phase.as_deref()) == Some("Running");
    let ready_condition = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);

    let readiness = if meta.deletion_timestamp.is_some() {
        Readiness::Terminating
    } else if running && ready_condition {
        Readiness::Ready
    } else {
        Readiness::Pending
    };

    ShadowEndpoint {
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        pod_ip,
        readiness,
        labels: meta.labels.clone().unwrap_or_default(),
        owned: false,
        service: None,
    }
}

fn shadow_pod(spec: &WorkloadSpec) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(spec.labels.clone()),
            annotations: Some(spec.annotations.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "shadow".to_string(),
                image: Some(spec.image.clone()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                ports: Some(vec![ContainerPort {
                    name: Some("socks".to_string()),
                    container_port: i32::from(spec.port),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}

fn shadow_service(spec: &ServiceSpec) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        },
        spec: Some(K8sServiceSpec {
            selector: Some(spec.selector.clone()),
            ports: Some(
                spec.ports
                    .iter()
                    .map(|(port, target)| ServicePort {
                        name: Some(format!("tcp-{}", port)),
                        port: i32::from(*port),
                        target_port: Some(IntOrString::Int(i32::from(*target))),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 404)
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<ShadowEndpoint> {
        debug!("Creating pod {}/{}", spec.namespace, spec.name);
        let pod = self
            .pods(&spec.namespace)
            .create(&PostParams::default(), &shadow_pod(spec))
            .await?;
        Ok(endpoint_from_pod(&pod))
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<ShadowEndpoint>> {
        let pod = self.pods(namespace).get_opt(name).await?;
        Ok(pod.as_ref().map(endpoint_from_pod))
    }

    async fn find_workloads(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ShadowEndpoint>> {
        let params = ListParams::default().labels(&format_selector(selector));
        let pods = self.pods(namespace).list(&params).await?;
        Ok(pods.items.iter().map(endpoint_from_pod).collect())
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()> {
        match self.pods(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<()> {
        debug!("Creating service {}/{}", spec.namespace, spec.name);
        self.services(&spec.namespace)
            .create(&PostParams::default(), &shadow_service(spec))
            .await?;
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .services(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_node_cidrs(&self) -> Result<Vec<IpNet>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;

        let mut cidrs = Vec::new();
        for node in &list.items {
            let Some(spec) = node.spec.as_ref() else {
                continue;
            };
            let declared = spec
                .pod_cidrs
                .clone()
                .filter(|v| !v.is_empty())
                .or_else(|| spec.pod_cidr.clone().map(|c| vec![c]))
                .unwrap_or_default();
            for cidr in declared {
                match cidr.parse::<IpNet>() {
                    Ok(net) => cidrs.push(net.trunc()),
                    Err(e) => warn!(
                        "Ignoring pod CIDR {} of node {:?}: {}",
                        cidr, node.metadata.name, e
                    ),
                }
            }
        }
        Ok(cidrs)
    }

    async fn list_pod_ips(&self, namespace: &str) -> Result<Vec<IpAddr>> {
        let pods = self.pods(namespace).list(&ListParams::default()).await?;
        Ok(pods
            .items
            .iter()
            .filter(|p| p.spec.as_ref().and_then(|s| s.host_network) != Some(true))
            .filter_map(|p| p.status.as_ref()?.pod_ip.as_deref()?.parse().ok())
            .collect())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<ServiceRecord>> {
        let services = self.services(namespace).list(&ListParams::default()).await?;
        Ok(services
            .items
            .iter()
            .filter_map(|svc| {
                let spec = svc.spec.as_ref()?;
                // headless services have no routable address
                let cluster_ip = spec.cluster_ip.as_deref()?.parse::<IpAddr>().ok()?;
                let ports = spec
                    .ports
                    .iter()
                    .flatten()
                    .filter(|p| p.protocol.as_deref().unwrap_or("TCP") == "TCP")
                    .filter_map(|p| u16::try_from(p.port).ok())
                    .collect();
                Some(ServiceRecord {
                    name: svc.metadata.name.clone()?,
                    namespace: svc.metadata.namespace.clone().unwrap_or_default(),
                    cluster_ip,
                    ports,
                })
            })
            .collect())
    }

    async fn heartbeat(&self, namespace: &str, name: &str) -> Result<()> {
        let mut annotations = serde_json::Map::new();
        annotations.insert(
            ANNOTATION_HEARTBEAT.to_string(),
            chrono::Utc::now().timestamp().to_string().into(),
        );
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        self.pods(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn pod(phase: &str, ready: bool, ip: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("kt-shadow-abcde".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some(phase.into()),
                pod_ip: ip.map(String::from),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".into(),
                    status: if ready { "True" } else { "False" }.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_endpoint_from_running_pod() {
        let ep = endpoint_from_pod(&pod("Running", true, Some("10.244.1.7")));
        assert_eq!(ep.readiness, Readiness::Ready);
        assert_eq!(ep.pod_ip, Some("10.244.1.7".parse().unwrap()));
        assert!(ep.is_ready());
    }

    #[test]
    fn test_endpoint_from_pending_pod() {
        let ep = endpoint_from_pod(&pod("Pending", false, None));
        assert_eq!(ep.readiness, Readiness::Pending);
        assert!(!ep.is_ready());
    }

    #[test]
    fn test_endpoint_from_terminating_pod() {
        let mut p = pod("Running", true, Some("10.244.1.7"));
        p.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_eq!(endpoint_from_pod(&p).readiness, Readiness::Terminating);
    }

    #[test]
    fn test_shadow_pod_shape() {
        let spec = WorkloadSpec {
            name: "kt-shadow-abcde".into(),
            namespace: "dev".into(),
            image: "shadow:latest".into(),
            port: 1080,
            labels: BTreeMap::from([("kt-role".to_string(), "shadow".to_string())]),
            annotations: BTreeMap::new(),
        };
        let pod = shadow_pod(&spec);
        let container = &pod.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("shadow:latest"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 1080);
        assert_eq!(pod.metadata.labels.unwrap()["kt-role"], "shadow");
    }
}
