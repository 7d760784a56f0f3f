//! Cluster resource gateway
//!
//! The engine only talks to the control plane through [`ClusterGateway`].
//! [`KubeGateway`] is the production implementation; the `testing` module
//! provides an in-memory one.

pub mod cidr;
mod k8s;

pub use k8s::KubeGateway;
pub use cidr::CidrResolver;

use crate::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Label marking objects created by this tool
pub const LABEL_CONTROL_BY: &str = "control-by";
pub const CONTROL_BY_VALUE: &str = "kube-tunnel";
/// Label carrying the shadow role
pub const LABEL_ROLE: &str = "kt-role";
/// Label carrying the connect method the shadow serves
pub const LABEL_COMPONENT: &str = "kt-component";
/// Annotation refreshed by the heartbeat task (unix seconds)
pub const ANNOTATION_HEARTBEAT: &str = "kt-last-heart-beat";
/// Annotation naming the session that created the object
pub const ANNOTATION_SESSION: &str = "kt-session-id";

/// Readiness of a shadow workload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    Terminating,
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Pending => write!(f, "pending"),
            Readiness::Ready => write!(f, "ready"),
            Readiness::Terminating => write!(f, "terminating"),
        }
    }
}

/// Identity of the in-cluster end of the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowEndpoint {
    pub name: String,
    pub namespace: String,
    pub pod_ip: Option<IpAddr>,
    pub readiness: Readiness,
    pub labels: BTreeMap<String, String>,
    /// Created by this session (and therefore deleted by it)
    pub owned: bool,
    /// Service created alongside the shadow
    pub service: Option<String>,
}

impl ShadowEndpoint {
    pub fn is_ready(&self) -> bool {
        self.readiness == Readiness::Ready && self.pod_ip.is_some()
    }

    /// `namespace/name`
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Workload to create
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub port: u16,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Service to create in front of a workload
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub selector: BTreeMap<String, String>,
    /// (service port, target port)
    pub ports: Vec<(u16, u16)>,
}

/// A service with a routable cluster IP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub namespace: String,
    pub cluster_ip: IpAddr,
    /// TCP ports the service serves
    pub ports: Vec<u16>,
}

/// Control plane operations consumed by the engine.
///
/// Errors are `Error::Gateway`; `retryable` tells callers whether repeating
/// the call can help, `already_exists` flags create conflicts.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<ShadowEndpoint>;

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<ShadowEndpoint>>;

    /// Workloads whose labels include every entry of `selector`
    async fn find_workloads(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ShadowEndpoint>>;

    /// Delete a workload; deleting a missing one succeeds
    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()>;

    async fn create_service(&self, spec: &ServiceSpec) -> Result<()>;

    /// Delete a service; deleting a missing one succeeds
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    /// Pod ranges declared in node specs
    async fn list_node_cidrs(&self) -> Result<Vec<IpNet>>;

    async fn list_pod_ips(&self, namespace: &str) -> Result<Vec<IpAddr>>;

    /// Services with a cluster IP; an empty namespace lists all namespaces
    async fn list_services(&self, namespace: &str) -> Result<Vec<ServiceRecord>>;

    async fn list_service_ips(&self, namespace: &str) -> Result<Vec<IpAddr>> {
        Ok(self
            .list_services(namespace)
            .await?
            .into_iter()
            .map(|s| s.cluster_ip)
            .collect())
    }

    /// Refresh the heartbeat annotation of a workload
    async fn heartbeat(&self, namespace: &str, name: &str) -> Result<()>;
}
