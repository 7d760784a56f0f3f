//! Full tunnel method: routes every cluster range into a tun device
//!
//! A helper (e.g. tun2socks) bridges the device to the tunnel's local SOCKS
//! endpoint. Without a helper the device is expected to exist already.

use super::{ConnectionStrategy, RoutingPlan};
use crate::common::process::{ManagedProcess, ProcessSpec};
use crate::config::{ConnectMethod, FullTunnelConfig};
use crate::system::{Route, RouteTable};
use crate::transport::TunnelSession;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct FullTunnelStrategy {
    config: FullTunnelConfig,
    routes: Arc<dyn RouteTable>,
    installed: Vec<Route>,
    helper: Option<ManagedProcess>,
}

impl FullTunnelStrategy {
    pub fn new(config: FullTunnelConfig, routes: Arc<dyn RouteTable>) -> Self {
        FullTunnelStrategy {
            config,
            routes,
            installed: Vec::new(),
            helper: None,
        }
    }

    /// Routes currently installed by this strategy, in installation order
    pub fn installed(&self) -> &[Route] {
        &self.installed
    }

    fn helper_spec(&self, helper: &str, tunnel: &TunnelSession) -> ProcessSpec {
        let proxy = format!("socks5://127.0.0.1:{}", tunnel.local_port());
        self.config
            .helper_args
            .iter()
            .map(|arg| {
                arg.replace("{device}", &self.config.device)
                    .replace("{proxy}", &proxy)
            })
            .fold(ProcessSpec::new(helper).without_proxy_env(), |spec, arg| spec.arg(arg))
    }

    async fn rollback(&mut self) {
        if let Err(e) = self.deactivate().await {
            warn!("Rollback of partially installed routes failed: {}", e);
        }
    }
}

#[async_trait]
impl ConnectionStrategy for FullTunnelStrategy {
    fn method(&self) -> ConnectMethod {
        ConnectMethod::FullTunnel
    }

    async fn activate(&mut self, tunnel: &TunnelSession, plan: &RoutingPlan) -> Result<usize> {
        let cidrs = match plan {
            RoutingPlan::Routes { cidrs, .. } => cidrs,
            RoutingPlan::Proxy { .. } => {
                return Err(Error::internal("full tunnel method needs a route plan"));
            }
        };

        if let Some(helper) = self.config.helper.clone() {
            let spec = self.helper_spec(&helper, tunnel);
            self.helper = Some(ManagedProcess::spawn(spec).await?);
        }

        for cidr in cidrs {
            match self.routes.add(cidr, &self.config.device).await {
                Ok(route) => {
                    debug!("Route {} added", route);
                    self.installed.push(route);
                }
                Err(e) => {
                    self.rollback().await;
                    return Err(e);
                }
            }
        }

        info!(
            "{} routes installed on {}",
            self.installed.len(),
            self.config.device
        );
        Ok(self.installed.len())
    }

    async fn deactivate(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(route) = self.installed.pop() {
            match self.routes.remove(&route).await {
                Ok(true) => debug!("Route {} removed", route),
                Ok(false) => debug!("Route {} was already removed", route),
                Err(e) => {
                    warn!("Failed to remove route {}: {}", route, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(helper) = self.helper.take() {
            helper.stop().await;
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Backoff, EventBus};
    use crate::testing::{ready_endpoint, MemoryRouteTable, ScriptedBackend};
    use crate::transport::TunnelTransport;
    use ipnet::IpNet;
    use tokio_util::sync::CancellationToken;

    async fn tunnel(port: u16) -> TunnelSession {
        TunnelTransport::new(Arc::new(ScriptedBackend::new()), Backoff::default(), EventBus::new("t"))
            .open(&ready_endpoint("shadow-a"), 1080, port, &CancellationToken::new())
            .await
            .unwrap()
    }

    fn plan(items: &[&str]) -> RoutingPlan {
        RoutingPlan::routes(items.iter().map(|s| s.parse::<IpNet>().unwrap()).collect())
    }

    #[tokio::test]
    async fn test_routes_installed_and_removed_in_reverse() {
        let tunnel = tunnel(42301).await;
        let table = Arc::new(MemoryRouteTable::new());
        let mut strategy = FullTunnelStrategy::new(FullTunnelConfig::default(), table.clone());

        let count = strategy
            .activate(&tunnel, &plan(&["192.168.0.0/24", "172.168.0.0/16", "10.10.10.0/24"]))
            .await
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(table.routes().len(), 3);

        strategy.deactivate().await.unwrap();
        assert!(table.routes().is_empty());
        assert_eq!(
            table.removed(),
            vec!["10.10.10.0/24", "172.168.0.0/16", "192.168.0.0/24"]
        );
        tunnel.close().await;
    }

    #[tokio::test]
    async fn test_failure_on_second_route_removes_only_first() {
        let tunnel = tunnel(42302).await;
        let table = Arc::new(MemoryRouteTable::new());
        table.fail_add_at(2);
        let mut strategy = FullTunnelStrategy::new(FullTunnelConfig::default(), table.clone());

        let err = strategy
            .activate(&tunnel, &plan(&["192.168.0.0/24", "172.168.0.0/16", "10.10.10.0/24"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::System(_)));
        assert_eq!(table.removed(), vec!["192.168.0.0/24"]);
        assert!(table.routes().is_empty());
        assert!(strategy.installed().is_empty());
        tunnel.close().await;
    }

    #[tokio::test]
    async fn test_already_removed_route_is_success() {
        let tunnel = tunnel(42303).await;
        let table = Arc::new(MemoryRouteTable::new());
        let mut strategy = FullTunnelStrategy::new(FullTunnelConfig::default(), table.clone());
        strategy
            .activate(&tunnel, &plan(&["10.96.0.0/16", "10.244.0.0/16"]))
            .await
            .unwrap();

        // someone else deleted a route behind our back
        table.forget("10.96.0.0/16");
        strategy.deactivate().await.unwrap();
        assert!(table.routes().is_empty());
        tunnel.close().await;
    }

    #[tokio::test]
    async fn test_helper_arguments() {
        let tunnel = tunnel(42304).await;
        let config = FullTunnelConfig {
            device: "utun7".into(),
            ..Default::default()
        };
        let strategy = FullTunnelStrategy::new(config, Arc::new(MemoryRouteTable::new()));
        let spec = strategy.helper_spec("tun2socks", &tunnel);
        assert_eq!(
            spec.display(),
            "tun2socks -device tun://utun7 -proxy socks5://127.0.0.1:42304"
        );
        assert!(spec.env_removed.iter().any(|k| k == "HTTPS_PROXY"));
        tunnel.close().await;
    }
}
