//! Host state mutation
//!
//! Everything a session changes on the local machine goes through one of
//! three hooks. Each `apply`-style call returns a token that carries exactly
//! what is needed to undo it, so a revert never touches state it did not
//! create.

mod hosts;
mod proxy;
mod route;

pub use hosts::HostsFile;
pub use proxy::EnvProxyRegistry;
pub use route::IpRouteTable;

use crate::common::socks::SocksVersion;
use crate::config::Config;
use crate::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// The hooks a session mutates host state through
#[derive(Clone)]
pub struct SystemHooks {
    pub proxy: Arc<dyn ProxyRegistry>,
    pub routes: Arc<dyn RouteTable>,
    pub dns: Arc<dyn DnsRules>,
}

impl SystemHooks {
    /// Environment proxy, platform routing tools and the configured hosts file
    pub fn native(config: &Config) -> Self {
        SystemHooks {
            proxy: Arc::new(EnvProxyRegistry::new()),
            routes: Arc::new(IpRouteTable::new()),
            dns: Arc::new(HostsFile::new(&config.mesh.hosts_file)),
        }
    }
}

/// Proxy settings to register
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub address: SocketAddr,
    pub version: SocksVersion,
    pub bypass: Vec<String>,
}

impl ProxySettings {
    /// `socks5://127.0.0.1:2223`
    pub fn url(&self) -> String {
        format!("{}://{}", self.version.scheme(), self.address)
    }
}

/// Values captured before the proxy settings were applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRevert {
    /// (key, previous value); `None` when the key was unset
    pub previous: Vec<(String, Option<String>)>,
}

#[async_trait]
pub trait ProxyRegistry: Send + Sync {
    async fn apply(&self, settings: &ProxySettings) -> Result<ProxyRevert>;

    /// Restore the captured values verbatim
    async fn revert(&self, token: ProxyRevert) -> Result<()>;
}

/// An installed route
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub cidr: IpNet,
    pub device: String,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} dev {}", self.cidr, self.device)
    }
}

#[async_trait]
pub trait RouteTable: Send + Sync {
    async fn add(&self, cidr: &IpNet, device: &str) -> Result<Route>;

    /// Remove a route; `Ok(false)` when it was already gone
    async fn remove(&self, route: &Route) -> Result<bool>;
}

/// One name-to-address mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub ip: IpAddr,
    pub names: Vec<String>,
}

/// Identifies an installed rule block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRevert {
    pub block: String,
    pub entries: usize,
}

#[async_trait]
pub trait DnsRules: Send + Sync {
    /// Install (or replace) the rule block named `block`
    async fn install(&self, block: &str, entries: &[HostEntry]) -> Result<DnsRevert>;

    /// Remove only the given block
    async fn remove(&self, token: DnsRevert) -> Result<()>;
}
