//! Connection methods
//!
//! A strategy wires local traffic into an established tunnel:
//! - `proxy`: the tunnel's local port is a SOCKS endpoint, optionally
//!   registered as the process-wide proxy
//! - `full-tunnel`: one route per cluster range through a tun device
//! - `mesh`: service names mapped to loopback aliases, each relayed through
//!   the tunnel's SOCKS endpoint to the service's cluster IP; no routes
//!
//! `activate` either applies everything or nothing: a failure rolls back the
//! mutations made so far before the error is returned.

mod full_tunnel;
mod mesh;
mod proxy;
mod relay;

pub use full_tunnel::FullTunnelStrategy;
pub use mesh::MeshStrategy;
pub use proxy::ProxyStrategy;

use crate::cluster::{ClusterGateway, ServiceRecord};
use crate::common::net::loopback;
use crate::config::{Config, ConnectMethod};
use crate::system::{HostEntry, SystemHooks};
use crate::transport::TunnelSession;
use crate::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use std::net::SocketAddr;
use tracing::debug;

/// What a strategy applies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingPlan {
    Proxy {
        address: SocketAddr,
        bypass: Vec<String>,
        /// Service names dumped into the hosts file
        hosts: Vec<HostEntry>,
    },
    Routes {
        cidrs: Vec<IpNet>,
        /// Services the mesh method maps by name
        services: Vec<ServiceNames>,
    },
}

/// The names of one service, its cluster IP and TCP ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNames {
    pub entry: HostEntry,
    pub ports: Vec<u16>,
}

impl RoutingPlan {
    pub fn proxy(tunnel: &TunnelSession, bypass: Vec<String>) -> Self {
        RoutingPlan::Proxy {
            address: loopback(tunnel.local_port()),
            bypass,
            hosts: Vec::new(),
        }
    }

    pub fn routes(cidrs: Vec<IpNet>) -> Self {
        RoutingPlan::Routes {
            cidrs,
            services: Vec::new(),
        }
    }
}

#[async_trait]
pub trait ConnectionStrategy: Send + Sync {
    fn method(&self) -> ConnectMethod;

    /// Apply the plan, returning the number of installed entries
    async fn activate(&mut self, tunnel: &TunnelSession, plan: &RoutingPlan) -> Result<usize>;

    /// Undo everything `activate` applied; calling it again is a no-op
    async fn deactivate(&mut self) -> Result<()>;
}

/// Strategy for the configured method
pub fn strategy_for(config: &Config, hooks: &SystemHooks, session_id: &str) -> Box<dyn ConnectionStrategy> {
    match config.method {
        ConnectMethod::Proxy => Box::new(ProxyStrategy::new(
            config.proxy.clone(),
            hooks.proxy.clone(),
            hooks.dns.clone(),
            session_id,
        )),
        ConnectMethod::FullTunnel => Box::new(FullTunnelStrategy::new(
            config.full_tunnel.clone(),
            hooks.routes.clone(),
        )),
        ConnectMethod::Mesh => Box::new(MeshStrategy::new(
            hooks.dns.clone(),
            session_id,
            config.mesh.relay_range,
        )),
    }
}

/// Names for the services of the given namespaces.
///
/// Services of `home` also get their bare name. With `within`, services whose
/// cluster IP lies outside every range are skipped.
pub async fn service_names(
    gateway: &dyn ClusterGateway,
    namespaces: &[String],
    home: &str,
    cluster_domain: &str,
    within: Option<&[IpNet]>,
) -> Result<Vec<ServiceNames>> {
    let mut entries = Vec::new();
    for namespace in namespaces {
        for service in gateway.list_services(namespace).await? {
            if let Some(ranges) = within {
                if !ranges.iter().any(|r| r.contains(&service.cluster_ip)) {
                    debug!("Skipping {}.{}, {} is not routed", service.name, service.namespace, service.cluster_ip);
                    continue;
                }
            }
            entries.push(ServiceNames {
                entry: host_entry(&service, home, cluster_domain),
                ports: service.ports,
            });
        }
    }
    Ok(entries)
}

fn host_entry(service: &ServiceRecord, home: &str, cluster_domain: &str) -> HostEntry {
    let mut names = Vec::with_capacity(3);
    if service.namespace == home {
        names.push(service.name.clone());
    }
    names.push(format!("{}.{}", service.name, service.namespace));
    names.push(format!(
        "{}.{}.svc.{}",
        service.name, service.namespace, cluster_domain
    ));
    HostEntry {
        ip: service.cluster_ip,
        names,
    }
}
