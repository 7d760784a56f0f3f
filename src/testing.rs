//! In-memory collaborators for tests
//!
//! Fakes of the cluster gateway, the forward backend and the host-state
//! hooks. They record every call so tests can assert on what the engine did.
//! Helpers taking address literals panic on malformed input.

use crate::cluster::{
    ClusterGateway, Readiness, ServiceRecord, ServiceSpec, ShadowEndpoint, WorkloadSpec,
};
use crate::common::net::bind_local;
use crate::common::GatewayError;
use crate::config::TransportKind;
use crate::system::{
    DnsRevert, DnsRules, HostEntry, ProxyRegistry, ProxyRevert, ProxySettings, Route, RouteTable,
};
use crate::transport::{ForwardBackend, ForwardHandle};
use crate::{Error, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

fn literal<T: FromStr>(s: &str) -> T
where
    T::Err: Debug,
{
    match s.parse() {
        Ok(value) => value,
        Err(e) => panic!("invalid literal {:?}: {:?}", s, e),
    }
}

/// A ready endpoint in `default` owned by the session
pub fn ready_endpoint(name: &str) -> ShadowEndpoint {
    ShadowEndpoint {
        name: name.to_string(),
        namespace: "default".to_string(),
        pod_ip: Some(IpAddr::V4(Ipv4Addr::new(10, 244, 0, 9))),
        readiness: Readiness::Ready,
        labels: BTreeMap::new(),
        owned: true,
        service: None,
    }
}

// ---------------------------------------------------------------------------
// Cluster gateway
// ---------------------------------------------------------------------------

#[derive(Default)]
struct GatewayState {
    workloads: BTreeMap<(String, String), ShadowEndpoint>,
    /// get_workload calls per workload
    polls: BTreeMap<(String, String), u32>,
    services: Vec<ServiceRecord>,
    created_services: Vec<String>,
    deleted_workloads: Vec<String>,
    deleted_services: Vec<String>,
    nodes: Vec<Option<IpNet>>,
    pod_ips: Vec<(String, IpAddr)>,
    forbid_nodes: bool,
    ready_after: Option<u32>,
    create_failures: VecDeque<GatewayError>,
    lose_create_response: bool,
    creates: u32,
    gets: u32,
    heartbeats: u32,
    next_ip: u8,
}

/// In-memory control plane.
///
/// Created workloads become ready on the first readiness poll unless
/// configured otherwise.
pub struct MemoryGateway {
    state: Mutex<GatewayState>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        MemoryGateway {
            state: Mutex::new(GatewayState {
                ready_after: Some(1),
                next_ip: 10,
                ..Default::default()
            }),
        }
    }

    pub fn add_node(&self, _name: &str, pod_cidr: Option<&str>) {
        self.state.lock().nodes.push(pod_cidr.map(literal));
    }

    pub fn add_pod_ip(&self, namespace: &str, _name: &str, ip: &str) {
        self.state
            .lock()
            .pod_ips
            .push((namespace.to_string(), literal(ip)));
    }

    /// Add a service serving port 8080
    pub fn add_service(&self, namespace: &str, name: &str, cluster_ip: &str) {
        self.add_service_ports(namespace, name, cluster_ip, &[8080]);
    }

    pub fn add_service_ports(&self, namespace: &str, name: &str, cluster_ip: &str, ports: &[u16]) {
        self.state.lock().services.push(ServiceRecord {
            name: name.to_string(),
            namespace: namespace.to_string(),
            cluster_ip: literal(cluster_ip),
            ports: ports.to_vec(),
        });
    }

    /// Listing nodes fails with a permission error
    pub fn forbid_node_list(&self) {
        self.state.lock().forbid_nodes = true;
    }

    /// Put an existing workload into the cluster
    pub fn insert_workload(&self, endpoint: ShadowEndpoint) {
        let key = (endpoint.namespace.clone(), endpoint.name.clone());
        self.state.lock().workloads.insert(key, endpoint);
    }

    /// Created workloads become ready after `polls` readiness polls
    pub fn ready_after(&self, polls: u32) {
        self.state.lock().ready_after = Some(polls);
    }

    /// Created workloads never become ready
    pub fn never_ready(&self) {
        self.state.lock().ready_after = None;
    }

    /// Fail the next creates with the given errors, in order
    pub fn fail_creates(&self, errors: impl IntoIterator<Item = GatewayError>) {
        self.state.lock().create_failures.extend(errors);
    }

    /// The next create is applied but its response is lost
    pub fn lose_create_response(&self) {
        self.state.lock().lose_create_response = true;
    }

    pub fn creates(&self) -> u32 {
        self.state.lock().creates
    }

    pub fn gets(&self) -> u32 {
        self.state.lock().gets
    }

    pub fn heartbeats(&self) -> u32 {
        self.state.lock().heartbeats
    }

    pub fn workload_names(&self) -> Vec<String> {
        self.state
            .lock()
            .workloads
            .keys()
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn workload(&self, namespace: &str, name: &str) -> Option<ShadowEndpoint> {
        self.state
            .lock()
            .workloads
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn created_services(&self) -> Vec<String> {
        self.state.lock().created_services.clone()
    }

    pub fn deleted_workloads(&self) -> Vec<String> {
        self.state.lock().deleted_workloads.clone()
    }

    pub fn deleted_services(&self) -> Vec<String> {
        self.state.lock().deleted_services.clone()
    }
}

#[async_trait]
impl ClusterGateway for MemoryGateway {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<ShadowEndpoint> {
        let mut state = self.state.lock();
        state.creates += 1;
        if let Some(err) = state.create_failures.pop_front() {
            return Err(err.into());
        }
        let key = (spec.namespace.clone(), spec.name.clone());
        if state.workloads.contains_key(&key) {
            return Err(GatewayError::already_exists(format!("pods \"{}\" already exists", spec.name)).into());
        }
        let endpoint = ShadowEndpoint {
            name: spec.name.clone(),
            namespace: spec.namespace.clone(),
            pod_ip: None,
            readiness: Readiness::Pending,
            labels: spec.labels.clone(),
            owned: true,
            service: None,
        };
        state.workloads.insert(key, endpoint.clone());
        if std::mem::take(&mut state.lose_create_response) {
            return Err(GatewayError::transient("connection reset while creating pod").into());
        }
        Ok(endpoint)
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<ShadowEndpoint>> {
        let mut state = self.state.lock();
        state.gets += 1;
        let key = (namespace.to_string(), name.to_string());
        let polls = {
            let counter = state.polls.entry(key.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let ready_after = state.ready_after;
        let next_ip = state.next_ip;
        let mut assigned = false;
        let result = match state.workloads.get_mut(&key) {
            Some(endpoint) => {
                if endpoint.readiness == Readiness::Pending
                    && ready_after.map_or(false, |after| polls >= after)
                {
                    endpoint.readiness = Readiness::Ready;
                    endpoint.pod_ip = Some(IpAddr::V4(Ipv4Addr::new(10, 244, 0, next_ip)));
                    assigned = true;
                }
                Some(endpoint.clone())
            }
            None => None,
        };
        if assigned {
            state.next_ip = state.next_ip.wrapping_add(1);
        }
        Ok(result)
    }

    async fn find_workloads(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ShadowEndpoint>> {
        Ok(self
            .state
            .lock()
            .workloads
            .values()
            .filter(|w| w.namespace == namespace)
            .filter(|w| selector.iter().all(|(k, v)| w.labels.get(k) == Some(v)))
            .cloned()
            .collect())
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state
            .workloads
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some()
        {
            state.deleted_workloads.push(name.to_string());
        }
        Ok(())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<()> {
        let mut state = self.state.lock();
        if state.created_services.contains(&spec.name) {
            return Err(GatewayError::already_exists(format!("services \"{}\" already exists", spec.name)).into());
        }
        state.created_services.push(spec.name.clone());
        Ok(())
    }

    async fn delete_service(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(pos) = state.created_services.iter().position(|s| s == name) {
            state.created_services.remove(pos);
            state.deleted_services.push(name.to_string());
        }
        Ok(())
    }

    async fn list_node_cidrs(&self) -> Result<Vec<IpNet>> {
        let state = self.state.lock();
        if state.forbid_nodes {
            return Err(GatewayError::fatal("nodes is forbidden: cannot list resource \"nodes\"").into());
        }
        Ok(state.nodes.iter().flatten().copied().collect())
    }

    async fn list_pod_ips(&self, namespace: &str) -> Result<Vec<IpAddr>> {
        Ok(self
            .state
            .lock()
            .pod_ips
            .iter()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, ip)| *ip)
            .collect())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<ServiceRecord>> {
        Ok(self
            .state
            .lock()
            .services
            .iter()
            .filter(|s| namespace.is_empty() || s.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn heartbeat(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state
            .workloads
            .contains_key(&(namespace.to_string(), name.to_string()))
        {
            return Err(GatewayError::fatal(format!("pods \"{}\" not found", name)).into());
        }
        state.heartbeats += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Forward backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BackendState {
    opens: u32,
    shutdowns: u32,
    fail_next: u32,
    refuse_port: bool,
    current: Option<oneshot::Sender<String>>,
    connects: Vec<SocketAddr>,
}

/// Forward backend whose behaviour is scripted by the test
#[derive(Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<BackendState>>,
    serve_socks: bool,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve SOCKS5 on the local port while open: greetings are answered,
    /// CONNECT requests are recorded and their streams echoed back
    pub fn serving_socks(mut self) -> Self {
        self.serve_socks = true;
        self
    }

    /// Fail the next `n` opens with a transient error
    pub fn fail_next(&self, n: u32) {
        self.state.lock().fail_next = n;
    }

    /// Every open fails because the local port is taken
    pub fn refuse_port(&self) {
        self.state.lock().refuse_port = true;
    }

    /// Close the current forward as if the remote end went away
    pub fn drop_current(&self, reason: &str) {
        if let Some(tx) = self.state.lock().current.take() {
            let _ = tx.send(reason.to_string());
        }
    }

    pub fn opens(&self) -> u32 {
        self.state.lock().opens
    }

    pub fn shutdowns(&self) -> u32 {
        self.state.lock().shutdowns
    }

    /// Targets of the CONNECT requests served so far
    pub fn connects(&self) -> Vec<SocketAddr> {
        self.state.lock().connects.clone()
    }
}

/// One SOCKS5 client: greeting, then an optional CONNECT whose stream is echoed
async fn serve_socks_client(mut stream: TcpStream, state: Arc<Mutex<BackendState>>) {
    let mut greeting = [0u8; 3];
    if stream.read_exact(&mut greeting).await.is_err()
        || stream.write_all(&[0x05, 0x00]).await.is_err()
    {
        return;
    }

    // greeting-only clients hang up here
    let mut header = [0u8; 4];
    if stream.read_exact(&mut header).await.is_err() {
        return;
    }
    let ip = match header[3] {
        0x01 => {
            let mut octets = [0u8; 4];
            if stream.read_exact(&mut octets).await.is_err() {
                return;
            }
            IpAddr::from(octets)
        }
        0x04 => {
            let mut octets = [0u8; 16];
            if stream.read_exact(&mut octets).await.is_err() {
                return;
            }
            IpAddr::from(octets)
        }
        _ => return,
    };
    let port = match stream.read_u16().await {
        Ok(port) => port,
        Err(_) => return,
    };
    state.lock().connects.push(SocketAddr::new(ip, port));

    if stream
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .is_err()
    {
        return;
    }
    let (mut reader, mut writer) = stream.split();
    let _ = tokio::io::copy(&mut reader, &mut writer).await;
}

#[async_trait]
impl ForwardBackend for ScriptedBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    async fn open(
        &self,
        _endpoint: &ShadowEndpoint,
        _remote_port: u16,
        local_port: u16,
    ) -> Result<Box<dyn ForwardHandle>> {
        {
            let mut state = self.state.lock();
            state.opens += 1;
            if state.refuse_port {
                return Err(Error::PortUnavailable(local_port));
            }
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(GatewayError::transient("scripted open failure").into());
            }
        }

        let stub = if self.serve_socks {
            let listener = bind_local(local_port).await?;
            let state = self.state.clone();
            Some(tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve_socks_client(stream, state.clone()));
                }
            }))
        } else {
            None
        };

        let (tx, rx) = oneshot::channel();
        self.state.lock().current = Some(tx);
        Ok(Box::new(ScriptedHandle {
            state: self.state.clone(),
            closed: Some(rx),
            stub,
            shut: false,
        }))
    }
}

struct ScriptedHandle {
    state: Arc<Mutex<BackendState>>,
    closed: Option<oneshot::Receiver<String>>,
    stub: Option<JoinHandle<()>>,
    shut: bool,
}

#[async_trait]
impl ForwardHandle for ScriptedHandle {
    async fn closed(&mut self) -> String {
        if let Some(rx) = self.closed.as_mut() {
            if let Ok(reason) = rx.await {
                self.closed = None;
                return reason;
            }
        }
        std::future::pending().await
    }

    async fn shutdown(&mut self) {
        if self.shut {
            return;
        }
        self.shut = true;
        self.state.lock().shutdowns += 1;
        if let Some(stub) = self.stub.take() {
            stub.abort();
            let _ = stub.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Host state hooks
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ProxyState {
    current: Option<ProxySettings>,
    applies: u32,
    reverts: u32,
}

/// Proxy registry remembering the applied settings
#[derive(Default)]
pub struct MemoryProxyRegistry {
    state: Mutex<ProxyState>,
}

impl MemoryProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<ProxySettings> {
        self.state.lock().current.clone()
    }

    pub fn applies(&self) -> u32 {
        self.state.lock().applies
    }

    pub fn reverts(&self) -> u32 {
        self.state.lock().reverts
    }
}

#[async_trait]
impl ProxyRegistry for MemoryProxyRegistry {
    async fn apply(&self, settings: &ProxySettings) -> Result<ProxyRevert> {
        let mut state = self.state.lock();
        state.applies += 1;
        let previous = state.current.replace(settings.clone());
        Ok(ProxyRevert {
            previous: vec![("proxy".to_string(), previous.map(|p| p.url()))],
        })
    }

    async fn revert(&self, _token: ProxyRevert) -> Result<()> {
        let mut state = self.state.lock();
        state.reverts += 1;
        state.current = None;
        Ok(())
    }
}

#[derive(Default)]
struct RouteState {
    routes: Vec<Route>,
    removed: Vec<String>,
    adds: u32,
    fail_at: Option<u32>,
}

/// Route table kept in memory
#[derive(Default)]
pub struct MemoryRouteTable {
    state: Mutex<RouteState>,
}

impl MemoryRouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `n`-th add call (1-based) fails
    pub fn fail_add_at(&self, n: u32) {
        self.state.lock().fail_at = Some(n);
    }

    /// Drop a route without going through `remove`
    pub fn forget(&self, cidr: &str) {
        let cidr: IpNet = literal(cidr);
        self.state.lock().routes.retain(|r| r.cidr != cidr);
    }

    pub fn routes(&self) -> Vec<Route> {
        self.state.lock().routes.clone()
    }

    /// Removed ranges, in removal order
    pub fn removed(&self) -> Vec<String> {
        self.state.lock().removed.clone()
    }
}

#[async_trait]
impl RouteTable for MemoryRouteTable {
    async fn add(&self, cidr: &IpNet, device: &str) -> Result<Route> {
        let mut state = self.state.lock();
        state.adds += 1;
        if state.fail_at == Some(state.adds) {
            return Err(Error::system(format!("failed to add route {}: Operation not permitted", cidr)));
        }
        let route = Route {
            cidr: *cidr,
            device: device.to_string(),
        };
        state.routes.push(route.clone());
        Ok(route)
    }

    async fn remove(&self, route: &Route) -> Result<bool> {
        let mut state = self.state.lock();
        match state.routes.iter().position(|r| r == route) {
            Some(pos) => {
                state.routes.remove(pos);
                state.removed.push(route.cidr.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Default)]
struct DnsState {
    blocks: Vec<(String, Vec<HostEntry>)>,
    fail_installs: bool,
}

/// DNS rule store kept in memory
#[derive(Default)]
pub struct MemoryDnsRules {
    state: Mutex<DnsState>,
}

impl MemoryDnsRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block owned by somebody else
    pub fn preinstall(&self, block: &str) {
        self.state.lock().blocks.push((block.to_string(), Vec::new()));
    }

    pub fn fail_installs(&self) {
        self.state.lock().fail_installs = true;
    }

    pub fn blocks(&self) -> Vec<String> {
        self.state
            .lock()
            .blocks
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn entries(&self, block: &str) -> Vec<HostEntry> {
        self.state
            .lock()
            .blocks
            .iter()
            .find(|(name, _)| name == block)
            .map(|(_, entries)| entries.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DnsRules for MemoryDnsRules {
    async fn install(&self, block: &str, entries: &[HostEntry]) -> Result<DnsRevert> {
        let mut state = self.state.lock();
        if state.fail_installs {
            return Err(Error::system("cannot write hosts file: Permission denied"));
        }
        match state.blocks.iter_mut().find(|(name, _)| name == block) {
            Some((_, existing)) => *existing = entries.to_vec(),
            None => state.blocks.push((block.to_string(), entries.to_vec())),
        }
        Ok(DnsRevert {
            block: block.to_string(),
            entries: entries.len(),
        })
    }

    async fn remove(&self, token: DnsRevert) -> Result<()> {
        self.state.lock().blocks.retain(|(name, _)| *name != token.block);
        Ok(())
    }
}
