//! Shadow heartbeat
//!
//! Refreshes the heartbeat annotation so cluster-side cleaners leave a shadow
//! in use alone.

use crate::cluster::{ClusterGateway, ShadowEndpoint};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Spawn the heartbeat task; it stops when `cancel` fires
pub fn spawn_heartbeat(
    gateway: Arc<dyn ClusterGateway>,
    endpoint: &ShadowEndpoint,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let namespace = endpoint.namespace.clone();
    let name = endpoint.name.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately; creation already stamped the annotation
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match gateway.heartbeat(&namespace, &name).await {
                        Ok(()) => debug!("Heartbeat sent to {}/{}", namespace, name),
                        Err(e) => warn!("Heartbeat to {}/{} failed: {}", namespace, name, e),
                    }
                }
            }
        }
        debug!("Heartbeat of {}/{} stopped", namespace, name);
    })
}
