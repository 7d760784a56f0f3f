//! Mesh method: every service gets a loopback alias whose ports relay through
//! the tunnel to the service's cluster IP; names resolve to the alias

use super::relay::Relay;
use super::{ConnectionStrategy, RoutingPlan};
use crate::common::net::loopback;
use crate::config::ConnectMethod;
use crate::system::{DnsRevert, DnsRules, HostEntry};
use crate::transport::TunnelSession;
use crate::{Error, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct MeshStrategy {
    dns: Arc<dyn DnsRules>,
    block: String,
    relay_range: IpNet,
    installed: Option<DnsRevert>,
    relays: Vec<Relay>,
    cancel: CancellationToken,
}

impl MeshStrategy {
    pub fn new(dns: Arc<dyn DnsRules>, block: impl Into<String>, relay_range: IpNet) -> Self {
        MeshStrategy {
            dns,
            block: block.into(),
            relay_range,
            installed: None,
            relays: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Start one relay per (alias, port) and return the entries to install
    async fn start_relays(&mut self, tunnel: &TunnelSession, plan: &RoutingPlan) -> Result<Vec<HostEntry>> {
        let services = match plan {
            RoutingPlan::Routes { services, .. } => services,
            RoutingPlan::Proxy { .. } => {
                return Err(Error::internal("mesh method needs a route plan"));
            }
        };

        let proxy = loopback(tunnel.local_port());
        let mut aliases = self.relay_range.hosts();
        let mut entries = Vec::new();
        for service in services {
            if service.ports.is_empty() {
                debug!("Skipping {}, no TCP ports", service.entry.ip);
                continue;
            }
            let alias = aliases.next().ok_or_else(|| {
                Error::config(format!(
                    "mesh.relay-range {} is too small for {} services",
                    self.relay_range,
                    services.len()
                ))
            })?;
            for port in &service.ports {
                let relay = Relay::spawn(
                    SocketAddr::new(alias, *port),
                    SocketAddr::new(service.entry.ip, *port),
                    proxy,
                    self.cancel.child_token(),
                )
                .await?;
                self.relays.push(relay);
            }
            entries.push(HostEntry {
                ip: alias,
                names: service.entry.names.clone(),
            });
        }

        if entries.is_empty() {
            return Err(Error::system(
                "no service with a TCP port falls inside the cluster ranges, nothing to map",
            ));
        }
        Ok(entries)
    }

    async fn stop_relays(&mut self) {
        self.cancel.cancel();
        for relay in self.relays.drain(..) {
            relay.join().await;
        }
        self.cancel = CancellationToken::new();
    }

    /// Aliases currently relaying
    pub fn aliases(&self) -> Vec<IpAddr> {
        let mut aliases: Vec<IpAddr> = self.relays.iter().map(|r| r.listen.ip()).collect();
        aliases.dedup();
        aliases
    }
}

#[async_trait]
impl ConnectionStrategy for MeshStrategy {
    fn method(&self) -> ConnectMethod {
        ConnectMethod::Mesh
    }

    async fn activate(&mut self, tunnel: &TunnelSession, plan: &RoutingPlan) -> Result<usize> {
        let entries = match self.start_relays(tunnel, plan).await {
            Ok(entries) => entries,
            Err(e) => {
                self.stop_relays().await;
                return Err(e);
            }
        };
        for relay in &self.relays {
            debug!("{} relays to {}", relay.listen, relay.target);
        }

        let token = match self.dns.install(&self.block, &entries).await {
            Ok(token) => token,
            Err(e) => {
                self.stop_relays().await;
                return Err(e);
            }
        };
        let count = token.entries;
        self.installed = Some(token);
        info!("{} service names mapped over {} relays", count, self.relays.len());
        Ok(count)
    }

    async fn deactivate(&mut self) -> Result<()> {
        let removed = match self.installed.take() {
            Some(token) => self.dns.remove(token).await,
            None => Ok(()),
        };
        self.stop_relays().await;
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Backoff, EventBus};
    use crate::connect::ServiceNames;
    use crate::testing::{ready_endpoint, MemoryDnsRules, ScriptedBackend};
    use crate::transport::TunnelTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn open(backend: Arc<ScriptedBackend>, port: u16) -> TunnelSession {
        TunnelTransport::new(backend, Backoff::default(), EventBus::new("t"))
            .open(&ready_endpoint("shadow-a"), 1080, port, &CancellationToken::new())
            .await
            .unwrap()
    }

    fn plan(services: Vec<(&str, Vec<&str>, Vec<u16>)>) -> RoutingPlan {
        RoutingPlan::Routes {
            cidrs: vec!["10.96.0.0/16".parse().unwrap()],
            services: services
                .into_iter()
                .map(|(ip, names, ports)| ServiceNames {
                    entry: HostEntry {
                        ip: ip.parse().unwrap(),
                        names: names.into_iter().map(String::from).collect(),
                    },
                    ports,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_mesh_installs_and_removes_own_block() {
        let tunnel = open(Arc::new(ScriptedBackend::new()), 42401).await;

        let dns = Arc::new(MemoryDnsRules::new());
        dns.preinstall("someone-else");
        let mut strategy = MeshStrategy::new(dns.clone(), "s1", "127.141.1.0/24".parse().unwrap());
        let plan = plan(vec![("10.96.0.10", vec!["web", "web.default"], vec![18081])]);

        assert_eq!(strategy.activate(&tunnel, &plan).await.unwrap(), 1);
        assert_eq!(dns.blocks(), vec!["someone-else".to_string(), "s1".to_string()]);
        assert_eq!(dns.entries("s1")[0].ip.to_string(), "127.141.1.1");

        strategy.deactivate().await.unwrap();
        strategy.deactivate().await.unwrap();
        assert_eq!(dns.blocks(), vec!["someone-else".to_string()]);
        assert!(strategy.aliases().is_empty());
        tunnel.close().await;
    }

    #[tokio::test]
    async fn test_mesh_names_reach_services_through_tunnel() {
        let backend = Arc::new(ScriptedBackend::new().serving_socks());
        let tunnel = open(backend.clone(), 42402).await;

        let dns = Arc::new(MemoryDnsRules::new());
        let mut strategy = MeshStrategy::new(dns.clone(), "s2", "127.141.2.0/24".parse().unwrap());
        let plan = plan(vec![
            ("10.96.0.10", vec!["web"], vec![18080, 18443]),
            ("10.96.3.4", vec!["db.infra"], vec![15432]),
        ]);
        assert_eq!(strategy.activate(&tunnel, &plan).await.unwrap(), 2);

        let entries = dns.entries("s2");
        assert_eq!(entries[0].names, vec!["web"]);
        assert_eq!(entries[0].ip.to_string(), "127.141.2.1");
        assert_eq!(entries[1].ip.to_string(), "127.141.2.2");

        // every installed name answers on every port of its service
        for (entry, port) in [(&entries[0], 18080), (&entries[0], 18443), (&entries[1], 15432)] {
            let mut stream = TcpStream::connect(SocketAddr::new(entry.ip, port)).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
            let mut echoed = [0u8; 4];
            stream.read_exact(&mut echoed).await.unwrap();
            assert_eq!(&echoed, b"ping");
        }
        let targets: Vec<String> = backend.connects().iter().map(|t| t.to_string()).collect();
        assert_eq!(targets, vec!["10.96.0.10:18080", "10.96.0.10:18443", "10.96.3.4:15432"]);

        strategy.deactivate().await.unwrap();
        assert!(TcpStream::connect("127.141.2.1:18080").await.is_err());
        tunnel.close().await;
    }

    #[tokio::test]
    async fn test_mesh_without_services_fails() {
        let tunnel = open(Arc::new(ScriptedBackend::new()), 42403).await;
        let dns = Arc::new(MemoryDnsRules::new());
        let mut strategy = MeshStrategy::new(dns.clone(), "s3", "127.141.3.0/24".parse().unwrap());

        let err = strategy.activate(&tunnel, &plan(vec![])).await.unwrap_err();
        assert!(matches!(err, Error::System(_)));

        // a service without TCP ports has nothing to relay
        let portless = plan(vec![("10.96.0.10", vec!["web"], vec![])]);
        assert!(strategy.activate(&tunnel, &portless).await.is_err());
        assert!(dns.blocks().is_empty());
        tunnel.close().await;
    }

    #[tokio::test]
    async fn test_mesh_rolls_back_relays_when_range_is_exhausted() {
        let tunnel = open(Arc::new(ScriptedBackend::new()), 42404).await;
        let dns = Arc::new(MemoryDnsRules::new());
        // a /30 has two usable aliases
        let mut strategy = MeshStrategy::new(dns.clone(), "s4", "127.141.4.0/30".parse().unwrap());
        let plan = plan(vec![
            ("10.96.0.1", vec!["a"], vec![18080]),
            ("10.96.0.2", vec!["b"], vec![18080]),
            ("10.96.0.3", vec!["c"], vec![18080]),
        ]);

        let err = strategy.activate(&tunnel, &plan).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(strategy.aliases().is_empty());
        assert!(dns.blocks().is_empty());
        // the aliases bound before the failure are free again
        let rebound = tokio::net::TcpListener::bind("127.141.4.1:18080").await;
        assert!(rebound.is_ok());
        tunnel.close().await;
    }
}
