//! Routing table manipulation through the platform tools
//!
//! `ip route` on Linux, `route` on macOS.

use super::{Route, RouteTable};
use crate::{Error, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use tokio::process::Command;
use tracing::debug;

/// Messages the tools print when the route does not exist
const MISSING_ROUTE_MARKERS: &[&str] = &["No such process", "not in table", "Cannot find"];
/// Messages printed when the route is already present
const EXISTING_ROUTE_MARKERS: &[&str] = &["File exists", "already in table"];

#[derive(Debug, Clone, Default)]
pub struct IpRouteTable;

impl IpRouteTable {
    pub fn new() -> Self {
        IpRouteTable
    }

    fn add_command(cidr: &IpNet, device: &str) -> (&'static str, Vec<String>) {
        if cfg!(target_os = "macos") {
            (
                "route",
                vec![
                    "-n".into(),
                    "add".into(),
                    family_flag(cidr).into(),
                    cidr.to_string(),
                    "-interface".into(),
                    device.into(),
                ],
            )
        } else {
            (
                "ip",
                vec![
                    "route".into(),
                    "add".into(),
                    cidr.to_string(),
                    "dev".into(),
                    device.into(),
                ],
            )
        }
    }

    fn delete_command(route: &Route) -> (&'static str, Vec<String>) {
        if cfg!(target_os = "macos") {
            (
                "route",
                vec![
                    "-n".into(),
                    "delete".into(),
                    family_flag(&route.cidr).into(),
                    route.cidr.to_string(),
                ],
            )
        } else {
            (
                "ip",
                vec![
                    "route".into(),
                    "del".into(),
                    route.cidr.to_string(),
                    "dev".into(),
                    route.device.clone(),
                ],
            )
        }
    }
}

fn family_flag(cidr: &IpNet) -> &'static str {
    match cidr {
        IpNet::V4(_) => "-net",
        IpNet::V6(_) => "-inet6",
    }
}

/// Run a tool, returning its combined output on failure
async fn run(program: &str, args: &[String]) -> Result<std::result::Result<(), String>> {
    debug!("Executing {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::system(format!("failed to execute {}: {}", program, e)))?;
    if output.status.success() {
        Ok(Ok(()))
    } else {
        let mut message = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if message.is_empty() {
            message = String::from_utf8_lossy(&output.stdout).trim().to_string();
        }
        Ok(Err(message))
    }
}

#[async_trait]
impl RouteTable for IpRouteTable {
    async fn add(&self, cidr: &IpNet, device: &str) -> Result<Route> {
        let (program, args) = Self::add_command(cidr, device);
        match run(program, &args).await? {
            Ok(()) => {}
            Err(message) if EXISTING_ROUTE_MARKERS.iter().any(|m| message.contains(m)) => {
                return Err(Error::system(format!(
                    "route {} already exists, refusing to take it over",
                    cidr
                )));
            }
            Err(message) => {
                return Err(Error::system(format!(
                    "failed to add route {} via {}: {}",
                    cidr, device, message
                )));
            }
        }
        Ok(Route {
            cidr: *cidr,
            device: device.to_string(),
        })
    }

    async fn remove(&self, route: &Route) -> Result<bool> {
        let (program, args) = Self::delete_command(route);
        match run(program, &args).await? {
            Ok(()) => Ok(true),
            Err(message) if MISSING_ROUTE_MARKERS.iter().any(|m| message.contains(m)) => Ok(false),
            Err(message) => Err(Error::system(format!(
                "failed to remove route {}: {}",
                route, message
            ))),
        }
    }
}
