//! SOCKS proxy method

use super::{ConnectionStrategy, RoutingPlan};
use crate::common::socks;
use crate::config::{ConnectMethod, ProxyModeConfig};
use crate::system::{DnsRevert, DnsRules, ProxyRegistry, ProxyRevert, ProxySettings};
use crate::transport::TunnelSession;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ProxyStrategy {
    config: ProxyModeConfig,
    registry: Arc<dyn ProxyRegistry>,
    dns: Arc<dyn DnsRules>,
    block: String,
    proxy: Option<ProxyRevert>,
    hosts: Option<DnsRevert>,
}

impl ProxyStrategy {
    pub fn new(
        config: ProxyModeConfig,
        registry: Arc<dyn ProxyRegistry>,
        dns: Arc<dyn DnsRules>,
        block: impl Into<String>,
    ) -> Self {
        ProxyStrategy {
            config,
            registry,
            dns,
            block: block.into(),
            proxy: None,
            hosts: None,
        }
    }

    async fn probe(&self, tunnel: &TunnelSession, address: SocketAddr) -> Result<()> {
        let version = self.config.socks_version;
        let check = async {
            let mut stream = TcpStream::connect(address).await?;
            socks::probe(&mut stream, version).await
        };
        match timeout(PROBE_TIMEOUT, check).await {
            Ok(res) => res,
            Err(_) => Err(Error::tunnel_lost(format!(
                "SOCKS endpoint of {} did not answer",
                tunnel.endpoint().name
            ))),
        }
    }
}

#[async_trait]
impl ConnectionStrategy for ProxyStrategy {
    fn method(&self) -> ConnectMethod {
        ConnectMethod::Proxy
    }

    async fn activate(&mut self, tunnel: &TunnelSession, plan: &RoutingPlan) -> Result<usize> {
        let (address, bypass, hosts) = match plan {
            RoutingPlan::Proxy {
                address,
                bypass,
                hosts,
            } => (*address, bypass, hosts),
            RoutingPlan::Routes { .. } => {
                return Err(Error::internal("proxy method needs a proxy plan"));
            }
        };

        self.probe(tunnel, address).await?;

        let settings = ProxySettings {
            address,
            version: self.config.socks_version,
            bypass: bypass.clone(),
        };
        let mut entries = 1;

        if self.config.global {
            self.proxy = Some(self.registry.apply(&settings).await?);
        }

        if self.config.dump_hosts && !hosts.is_empty() {
            match self.dns.install(&self.block, hosts).await {
                Ok(token) => {
                    entries += token.entries;
                    self.hosts = Some(token);
                }
                Err(e) => {
                    if let Err(revert) = self.deactivate().await {
                        warn!("Rollback of proxy settings failed: {}", revert);
                    }
                    return Err(e);
                }
            }
        }

        info!("Start SOCKS proxy at {}", settings.url());
        if !self.config.global {
            info!(
                "Use it with: export http_proxy={} https_proxy={}",
                settings.url(),
                settings.url()
            );
        }
        Ok(entries)
    }

    async fn deactivate(&mut self) -> Result<()> {
        let mut first_error = None;
        if let Some(token) = self.hosts.take() {
            if let Err(e) = self.dns.remove(token).await {
                warn!("Failed to remove dumped hosts: {}", e);
                first_error.get_or_insert(e);
            }
        }
        if let Some(token) = self.proxy.take() {
            if let Err(e) = self.registry.revert(token).await {
                warn!("Failed to restore proxy settings: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
