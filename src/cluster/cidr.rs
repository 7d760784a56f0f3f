//! Cluster CIDR resolution
//!
//! Computes the ranges a full tunnel or mesh session must route: pod ranges
//! from node specs (or inferred from pod IPs), service ranges inferred from
//! cluster IPs, then user-supplied ranges. The result is deduplicated and no
//! entry is contained in another.

use super::ClusterGateway;
use crate::common::backoff::{retry, Backoff};
use crate::config::CidrConfig;
use crate::{Error, Result};
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Addresses sharing fewer leading bits than this are never grouped
const IPV4_GROUP_THRESHOLD: u8 = 16;
const IPV6_GROUP_THRESHOLD: u8 = 64;

/// Resolver for the routed cluster ranges
pub struct CidrResolver {
    gateway: Arc<dyn ClusterGateway>,
    config: CidrConfig,
    cancel: CancellationToken,
    policy: Backoff,
}

impl CidrResolver {
    pub fn new(gateway: Arc<dyn ClusterGateway>, config: CidrConfig, cancel: CancellationToken) -> Self {
        CidrResolver {
            gateway,
            config,
            cancel,
            policy: Backoff::new(Duration::from_millis(200), Duration::from_secs(2), 3).with_jitter(),
        }
    }

    /// Resolve ranges in the order pod, service, extra
    pub async fn resolve(&self, namespace: &str, extra: &[IpNet]) -> Result<Vec<IpNet>> {
        let mut ranges = Vec::new();

        if !self.config.disable_pod_ip {
            ranges.extend(self.pod_ranges(namespace).await?);
        }

        let service_ips = retry(&self.policy, "list services", &self.cancel, || {
            self.gateway.list_service_ips(namespace)
        })
        .await?;
        let service_ranges = infer_ranges(&service_ips, self.config.service_prefix);
        debug!("Inferred service ranges {:?} from {} IPs", service_ranges, service_ips.len());
        ranges.extend(service_ranges);

        ranges.extend(extra.iter().map(IpNet::trunc));

        let excluded = self.config.exclude_ranges()?;
        ranges.retain(|r| !excluded.iter().any(|ex| ex.contains(r)));

        let ranges = dedup_ranges(ranges);
        if ranges.is_empty() {
            return Err(Error::NoRoutableRange);
        }

        info!(
            "Cluster ranges: {}",
            ranges.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", ")
        );
        Ok(ranges)
    }

    async fn pod_ranges(&self, namespace: &str) -> Result<Vec<IpNet>> {
        let node_cidrs = match retry(&self.policy, "list nodes", &self.cancel, || {
            self.gateway.list_node_cidrs()
        })
        .await
        {
            Ok(cidrs) => cidrs,
            // listing nodes needs cluster-wide permission; pod IPs are the fallback
            Err(Error::Gateway(e)) if !e.retryable => {
                warn!("Cannot read node pod CIDRs ({}), inferring from pod IPs", e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        if !node_cidrs.is_empty() {
            return Ok(node_cidrs);
        }

        let pod_ips = retry(&self.policy, "list pods", &self.cancel, || {
            self.gateway.list_pod_ips(namespace)
        })
        .await?;
        Ok(infer_ranges(&pod_ips, self.config.service_prefix))
    }
}

/// Number of leading bits two addresses of the same family share
fn common_prefix_len(a: &IpAddr, b: &IpAddr) -> Option<u8> {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => {
            Some((u32::from(*a) ^ u32::from(*b)).leading_zeros() as u8)
        }
        (IpAddr::V6(a), IpAddr::V6(b)) => {
            Some((u128::from(*a) ^ u128::from(*b)).leading_zeros() as u8)
        }
        _ => None,
    }
}

/// Infer enclosing ranges for a set of sampled addresses.
///
/// Addresses sharing at least 16 leading bits (64 for IPv6) form one group.
/// A group's range is its common prefix rounded down to an octet boundary,
/// never longer than `max_prefix` (64 for IPv6).
pub fn infer_ranges(ips: &[IpAddr], max_prefix: u8) -> Vec<IpNet> {
    let mut sorted = ips.to_vec();
    sorted.sort();
    sorted.dedup();

    // (representative address, common prefix length)
    let mut groups: Vec<(IpAddr, u8)> = Vec::new();
    for ip in &sorted {
        let threshold = if ip.is_ipv4() {
            IPV4_GROUP_THRESHOLD
        } else {
            IPV6_GROUP_THRESHOLD
        };
        let joined = groups.iter_mut().find_map(|(base, prefix)| {
            let shared = common_prefix_len(base, ip)?;
            (shared >= threshold).then(|| *prefix = (*prefix).min(shared))
        });
        if joined.is_none() {
            let full = if ip.is_ipv4() { 32 } else { 128 };
            groups.push((*ip, full));
        }
    }

    groups
        .into_iter()
        .filter_map(|(base, prefix)| {
            let cap = if base.is_ipv4() { max_prefix.min(32) } else { 64 };
            let aligned = (prefix / 8 * 8).min(cap);
            IpNet::new(base, aligned).ok().map(|net| net.trunc())
        })
        .collect()
}

/// Drop duplicates and ranges covered by a broader one, keeping first-seen order
pub fn dedup_ranges(ranges: Vec<IpNet>) -> Vec<IpNet> {
    let mut result: Vec<IpNet> = Vec::with_capacity(ranges.len());
    for range in ranges {
        if result.iter().any(|kept| kept.contains(&range)) {
            continue;
        }
        result.retain(|kept| !range.contains(kept));
        result.push(range);
    }
    result
}
