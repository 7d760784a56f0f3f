//! Integration tests for kube-tunnel sessions
//!
//! These tests drive whole sessions through the public API against the
//! in-memory cluster, backend and host state fakes.

use kube_tunnel::config::{ConnectMethod, TransportConfig};
use kube_tunnel::system::{HostsFile, SystemHooks};
use kube_tunnel::testing::{
    MemoryDnsRules, MemoryGateway, MemoryProxyRegistry, MemoryRouteTable, ScriptedBackend,
};
use kube_tunnel::{
    Config, ErrorKind, EventBus, SessionDeps, SessionLock, SessionState, SessionSupervisor, Stage,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn config(method: ConnectMethod, port: u16) -> Config {
    Config {
        method,
        transport: TransportConfig {
            local_port: port,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn cluster() -> Arc<MemoryGateway> {
    let gateway = Arc::new(MemoryGateway::new());
    gateway.add_node("node-a", Some("10.244.0.0/24"));
    gateway.add_node("node-b", Some("10.244.1.0/24"));
    gateway.add_service("default", "web", "10.96.0.10");
    gateway.add_service("staging", "db", "10.96.3.4");
    gateway
}

/// Test the proxy method against a backend answering SOCKS greetings
#[tokio::test]
async fn test_proxy_session_registers_and_reverts_global_proxy() {
    let gateway = cluster();
    let registry = Arc::new(MemoryProxyRegistry::new());
    let mut cfg = config(ConnectMethod::Proxy, 42601);
    cfg.proxy.global = true;

    let supervisor = SessionSupervisor::new(
        cfg,
        SessionDeps {
            gateway: gateway.clone(),
            backend: Arc::new(ScriptedBackend::new().serving_socks()),
            hooks: SystemHooks {
                proxy: registry.clone(),
                routes: Arc::new(MemoryRouteTable::new()),
                dns: Arc::new(MemoryDnsRules::new()),
            },
            lock: SessionLock::new(),
        },
        EventBus::new("kt-proxy"),
    );

    supervisor.start().await.unwrap();
    let current = registry.current().unwrap();
    assert_eq!(current.url(), "socks5://127.0.0.1:42601");

    supervisor.shutdown().await;
    assert!(registry.current().is_none());
    assert_eq!(registry.reverts(), 1);
    assert!(gateway.workload_names().is_empty());
}

/// Test that a persisted shadow is picked up by the next session
#[tokio::test(start_paused = true)]
async fn test_persisted_shadow_is_reused() {
    let gateway = cluster();
    let lock = SessionLock::new();
    let routes = Arc::new(MemoryRouteTable::new());
    let session = |port: u16| {
        let mut cfg = config(ConnectMethod::FullTunnel, port);
        cfg.shadow.persist = true;
        SessionSupervisor::new(
            cfg,
            SessionDeps {
                gateway: gateway.clone(),
                backend: Arc::new(ScriptedBackend::new()),
                hooks: SystemHooks {
                    proxy: Arc::new(MemoryProxyRegistry::new()),
                    routes: routes.clone(),
                    dns: Arc::new(MemoryDnsRules::new()),
                },
                lock: lock.clone(),
            },
            EventBus::new(format!("kt-{}", port)),
        )
    };

    let first = session(42602);
    first.start().await.unwrap();
    first.shutdown().await;
    assert_eq!(gateway.workload_names().len(), 1);
    assert!(routes.routes().is_empty());

    let second = session(42603);
    let mut events = second.events().subscribe();
    second.start().await.unwrap();
    assert_eq!(gateway.creates(), 1);

    let ready = events.try_recv().unwrap();
    assert_eq!(ready.kind.name(), "ShadowReady");
    let encoded = serde_json::to_value(&ready).unwrap();
    assert_eq!(encoded["reused"], json!(true));

    second.shutdown().await;
    // a reused shadow belongs to someone else
    assert_eq!(gateway.workload_names().len(), 1);
}

/// Test mesh names written to a real hosts file, reachable through the
/// tunnel, and stripped again
#[tokio::test]
async fn test_mesh_session_with_hosts_file() {
    let gateway = cluster();
    let dir = tempfile::tempdir().unwrap();
    let hosts_path = dir.path().join("hosts");
    std::fs::write(&hosts_path, "127.0.0.1\tlocalhost\n").unwrap();

    let mut cfg = config(ConnectMethod::Mesh, 42604);
    cfg.mesh.namespaces = vec!["default".to_string(), "staging".to_string()];
    cfg.mesh.relay_range = "127.204.0.0/24".parse().unwrap();
    let backend = Arc::new(ScriptedBackend::new().serving_socks());
    let supervisor = SessionSupervisor::new(
        cfg,
        SessionDeps {
            gateway: gateway.clone(),
            backend: backend.clone(),
            hooks: SystemHooks {
                proxy: Arc::new(MemoryProxyRegistry::new()),
                routes: Arc::new(MemoryRouteTable::new()),
                dns: Arc::new(HostsFile::new(&hosts_path)),
            },
            lock: SessionLock::new(),
        },
        EventBus::new("kt-mesh"),
    );

    supervisor.start().await.unwrap();
    let content = std::fs::read_to_string(&hosts_path).unwrap();
    assert!(content.contains("127.204.0.1\tweb web.default web.default.svc.cluster.local"));
    assert!(content.contains("127.204.0.2\tdb.staging db.staging.svc.cluster.local"));

    for alias in ["127.204.0.1:8080", "127.204.0.2:8080"] {
        let mut stream = TcpStream::connect(alias).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
    }
    let targets: Vec<String> = backend.connects().iter().map(|t| t.to_string()).collect();
    assert_eq!(targets, vec!["10.96.0.10:8080", "10.96.3.4:8080"]);

    supervisor.shutdown().await;
    let content = std::fs::read_to_string(&hosts_path).unwrap();
    assert_eq!(content, "127.0.0.1\tlocalhost\n");
}

/// Test cancelling a session whose shadow never becomes ready
#[tokio::test(start_paused = true)]
async fn test_shutdown_during_provisioning() {
    let gateway = cluster();
    gateway.never_ready();
    let lock = SessionLock::new();
    let supervisor = Arc::new(SessionSupervisor::new(
        config(ConnectMethod::FullTunnel, 42605),
        SessionDeps {
            gateway: gateway.clone(),
            backend: Arc::new(ScriptedBackend::new()),
            hooks: SystemHooks {
                proxy: Arc::new(MemoryProxyRegistry::new()),
                routes: Arc::new(MemoryRouteTable::new()),
                dns: Arc::new(MemoryDnsRules::new()),
            },
            lock: lock.clone(),
        },
        EventBus::new("kt-cancel"),
    ));

    let starting = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.start().await })
    };
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(supervisor.state(), SessionState::Provisioning);

    supervisor.shutdown().await;
    let err = starting.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(err.stage(), Some(Stage::Provisioning));
    assert!(gateway.workload_names().is_empty());
    assert!(!lock.is_held());
}

/// Test that event payloads keep their wire field names
#[test]
fn test_event_json_structure() {
    let bus = EventBus::new("kt-json");
    let mut rx = bus.subscribe();
    bus.emit(kube_tunnel::EventKind::TunnelReconnecting {
        pod: "kt-shadow-abcde".to_string(),
        attempt: 2,
        max_attempts: 5,
    });

    let event = rx.try_recv().unwrap();
    let value = serde_json::to_value(&event).unwrap();
    for field in ["at", "session", "type", "pod", "attempt", "max_attempts"] {
        assert!(value.get(field).is_some(), "Missing field: {}", field);
    }
    assert_eq!(value["type"], json!("tunnel-reconnecting"));
    assert_eq!(value["session"], json!("kt-json"));
}
