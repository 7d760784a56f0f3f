//! Configuration module

mod parser;

pub use parser::*;

use crate::common::socks::SocksVersion;
use crate::common::Backoff;
use crate::{Error, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;

/// Default local port of the tunnel
pub const DEFAULT_LOCAL_PORT: u16 = 2223;

/// Port the shadow's SOCKS server listens on
pub const DEFAULT_SHADOW_SOCKS_PORT: u16 = 1080;

/// How local traffic is routed into the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectMethod {
    /// SOCKS proxy, optionally registered as the global proxy
    #[default]
    #[serde(alias = "socks")]
    Proxy,
    /// Routes for every cluster range
    #[serde(alias = "vpn", alias = "tun")]
    FullTunnel,
    /// DNS rewrite of service names only
    #[serde(alias = "dns")]
    Mesh,
}

impl ConnectMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectMethod::Proxy => "proxy",
            ConnectMethod::FullTunnel => "full-tunnel",
            ConnectMethod::Mesh => "mesh",
        }
    }
}

impl fmt::Display for ConnectMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "proxy" | "socks" => Ok(ConnectMethod::Proxy),
            "full-tunnel" | "vpn" | "tun" => Ok(ConnectMethod::FullTunnel),
            "mesh" | "dns" => Ok(ConnectMethod::Mesh),
            _ => Err(Error::config(format!("Unknown connect method: {}", s))),
        }
    }
}

/// Which tunnel backend carries the bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process port-forward over the API server
    #[default]
    Direct,
    /// Delegated `kubectl port-forward` process
    Kubectl,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Direct => write!(f, "direct"),
            TransportKind::Kubectl => write!(f, "kubectl"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(TransportKind::Direct),
            "kubectl" => Ok(TransportKind::Kubectl),
            _ => Err(Error::config(format!("Unknown transport: {}", s))),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Namespace the shadow lives in
    pub namespace: String,

    /// Kubeconfig context (current context when unset)
    pub context: Option<String>,

    /// Connection method
    pub method: ConnectMethod,

    /// Log level
    pub log_level: Option<String>,

    pub shadow: ShadowConfig,

    pub transport: TransportConfig,

    pub proxy: ProxyModeConfig,

    pub full_tunnel: FullTunnelConfig,

    pub mesh: MeshConfig,

    pub cidr: CidrConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            namespace: "default".to_string(),
            context: None,
            method: ConnectMethod::default(),
            log_level: Some("info".to_string()),
            shadow: ShadowConfig::default(),
            transport: TransportConfig::default(),
            proxy: ProxyModeConfig::default(),
            full_tunnel: FullTunnelConfig::default(),
            mesh: MeshConfig::default(),
            cidr: CidrConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file (synchronous)
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::config("namespace cannot be empty"));
        }
        if self.transport.local_port == 0 {
            return Err(Error::config("transport.local-port cannot be 0"));
        }
        if self.shadow.remote_port == 0 {
            return Err(Error::config("shadow.remote-port cannot be 0"));
        }
        if self.shadow.image.is_empty() {
            return Err(Error::config("shadow.image cannot be empty"));
        }
        for (key, value) in &self.shadow.labels {
            validate_label(key, value)?;
        }
        if !(8..=32).contains(&self.cidr.service_prefix) {
            return Err(Error::config(format!(
                "cidr.service-prefix must be between 8 and 32, got {}",
                self.cidr.service_prefix
            )));
        }
        self.cidr.include_ranges()?;
        self.cidr.exclude_ranges()?;
        if self.method == ConnectMethod::FullTunnel && self.full_tunnel.device.is_empty() {
            return Err(Error::config("full-tunnel.device cannot be empty"));
        }
        match self.mesh.relay_range {
            IpNet::V4(range) if range.network().is_loopback() && range.prefix_len() < 31 => {}
            other => {
                return Err(Error::config(format!(
                    "mesh.relay-range must be an IPv4 loopback range of at least 4 addresses, got {}",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Save configuration to file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content).await?;
        Ok(())
    }
}

/// Shadow workload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ShadowConfig {
    /// Container image serving SOCKS on `remote-port`
    pub image: String,

    /// Name prefix of created pods
    pub name_prefix: String,

    /// Extra labels identifying this user's shadow
    pub labels: BTreeMap<String, String>,

    /// Port inside the shadow the tunnel connects to
    pub remote_port: u16,

    /// Keep an owned shadow running after the session ends
    pub persist: bool,

    /// Create a ClusterIP service in front of the shadow
    pub expose_service: bool,

    pub ready_timeout_secs: u64,

    pub poll_interval_ms: u64,

    /// Heartbeat annotation refresh interval (0 disables)
    pub heartbeat_secs: u64,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        ShadowConfig {
            image: "ghcr.io/kube-tunnel/shadow:latest".to_string(),
            name_prefix: "kt-shadow".to_string(),
            labels: BTreeMap::new(),
            remote_port: DEFAULT_SHADOW_SOCKS_PORT,
            persist: false,
            expose_service: false,
            ready_timeout_secs: 120,
            poll_interval_ms: 1000,
            heartbeat_secs: 60,
        }
    }
}

impl ShadowConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_secs > 0).then(|| Duration::from_secs(self.heartbeat_secs))
    }

    /// Readiness polling: starts at the poll interval, doubles up to 8x, bounded by the deadline
    pub fn readiness_backoff(&self) -> Backoff {
        let initial = self.poll_interval();
        Backoff::new(initial, initial * 8, 0)
    }
}

/// Tunnel transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TransportConfig {
    pub kind: TransportKind,

    /// kubectl executable for the delegated transport
    pub kubectl: String,

    /// Local port bound to the shadow
    pub local_port: u16,

    /// Consecutive failed opens before the tunnel is declared lost
    pub max_retries: u32,

    pub backoff_initial_ms: u64,

    pub backoff_max_ms: u64,

    /// Liveness probe interval of an established tunnel
    pub probe_interval_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            kind: TransportKind::default(),
            kubectl: "kubectl".to_string(),
            local_port: DEFAULT_LOCAL_PORT,
            max_retries: 5,
            backoff_initial_ms: 500,
            backoff_max_ms: 10_000,
            probe_interval_secs: 30,
        }
    }
}

impl TransportConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
            self.max_retries,
        )
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }
}

/// Proxy method configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProxyModeConfig {
    /// Register the tunnel as the proxy for this process and its children
    pub global: bool,

    /// Hosts that bypass the proxy
    pub bypass: Vec<String>,

    /// Dialect of the shadow's SOCKS server
    pub socks_version: SocksVersion,

    /// Also write service names into the hosts file
    pub dump_hosts: bool,
}

impl Default for ProxyModeConfig {
    fn default() -> Self {
        ProxyModeConfig {
            global: false,
            bypass: vec!["localhost".to_string(), "127.0.0.1".to_string()],
            socks_version: SocksVersion::default(),
            dump_hosts: false,
        }
    }
}

/// Full-tunnel method configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FullTunnelConfig {
    /// Interface routes are attached to
    pub device: String,

    /// Helper bridging `device` to the local SOCKS endpoint (e.g. tun2socks)
    pub helper: Option<String>,

    /// Helper arguments; `{device}` and `{proxy}` are substituted
    pub helper_args: Vec<String>,
}

impl Default for FullTunnelConfig {
    fn default() -> Self {
        FullTunnelConfig {
            device: "kt0".to_string(),
            helper: None,
            helper_args: vec![
                "-device".to_string(),
                "tun://{device}".to_string(),
                "-proxy".to_string(),
                "{proxy}".to_string(),
            ],
        }
    }
}

/// Mesh (DNS) method configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MeshConfig {
    pub hosts_file: String,

    pub cluster_domain: String,

    /// Namespaces whose services get names (session namespace when empty)
    pub namespaces: Vec<String>,

    /// Loopback range the service aliases are drawn from
    pub relay_range: IpNet,
}

impl Default for MeshConfig {
    fn default() -> Self {
        MeshConfig {
            hosts_file: default_hosts_file().to_string(),
            cluster_domain: "cluster.local".to_string(),
            namespaces: Vec::new(),
            relay_range: IpNet::V4(ipnet::Ipv4Net::new(std::net::Ipv4Addr::new(127, 77, 0, 0), 16).unwrap_or_default()),
        }
    }
}

fn default_hosts_file() -> &'static str {
    if cfg!(windows) {
        r"C:\Windows\System32\drivers\etc\hosts"
    } else {
        "/etc/hosts"
    }
}

/// Cluster range configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CidrConfig {
    /// Extra ranges (or bare IPs) to route
    pub include: Vec<String>,

    /// Ranges never routed
    pub exclude: Vec<String>,

    /// Longest prefix an inferred range may have; sampled addresses are widened to it
    pub service_prefix: u8,

    /// Skip pod ranges entirely
    pub disable_pod_ip: bool,
}

impl Default for CidrConfig {
    fn default() -> Self {
        CidrConfig {
            include: Vec::new(),
            exclude: Vec::new(),
            service_prefix: 16,
            disable_pod_ip: false,
        }
    }
}

impl CidrConfig {
    /// Entries may hold comma separated lists
    pub fn include_ranges(&self) -> Result<Vec<IpNet>> {
        flatten_ranges(&self.include)
    }

    pub fn exclude_ranges(&self) -> Result<Vec<IpNet>> {
        flatten_ranges(&self.exclude)
    }
}

fn flatten_ranges(entries: &[String]) -> Result<Vec<IpNet>> {
    let mut ranges = Vec::new();
    for entry in entries {
        ranges.extend(parse_range_list(entry)?);
    }
    Ok(ranges)
}
