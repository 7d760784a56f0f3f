//! Observable session events
//!
//! Events are published on a broadcast channel; the binary subscribes one
//! logging task, tests subscribe and assert on the sequence.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Channel capacity; slow subscribers see `Lagged` rather than blocking the engine
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Kind of a session event with its identifiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventKind {
    ShadowReady {
        name: String,
        namespace: String,
        pod_ip: String,
        reused: bool,
    },
    TunnelEstablished {
        pod: String,
        local_port: u16,
        remote_port: u16,
    },
    TunnelReconnecting {
        pod: String,
        attempt: u32,
        max_attempts: u32,
    },
    TunnelLost {
        pod: String,
        reason: String,
    },
    RoutingActivated {
        method: String,
        entries: usize,
    },
    SessionTornDown {
        cause: Option<String>,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ShadowReady { .. } => "ShadowReady",
            EventKind::TunnelEstablished { .. } => "TunnelEstablished",
            EventKind::TunnelReconnecting { .. } => "TunnelReconnecting",
            EventKind::TunnelLost { .. } => "TunnelLost",
            EventKind::RoutingActivated { .. } => "RoutingActivated",
            EventKind::SessionTornDown { .. } => "SessionTornDown",
        }
    }
}

/// A timestamped event
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub at: DateTime<Utc>,
    pub session: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EventKind::ShadowReady {
                name,
                namespace,
                pod_ip,
                reused,
            } => write!(
                f,
                "shadow {}/{} ready at {}{}",
                namespace,
                name,
                pod_ip,
                if *reused { " (reused)" } else { "" }
            ),
            EventKind::TunnelEstablished {
                pod,
                local_port,
                remote_port,
            } => write!(f, "tunnel 127.0.0.1:{} -> {}:{} established", local_port, pod, remote_port),
            EventKind::TunnelReconnecting {
                pod,
                attempt,
                max_attempts,
            } => write!(f, "tunnel to {} reconnecting ({}/{})", pod, attempt, max_attempts),
            EventKind::TunnelLost { pod, reason } => write!(f, "tunnel to {} lost: {}", pod, reason),
            EventKind::RoutingActivated { method, entries } => {
                write!(f, "{} routing active ({} entries)", method, entries)
            }
            EventKind::SessionTornDown { cause } => match cause {
                Some(cause) => write!(f, "session torn down after failure: {}", cause),
                None => write!(f, "session torn down"),
            },
        }
    }
}

/// Broadcast publisher shared by all components of one session
#[derive(Clone)]
pub struct EventBus {
    session: String,
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(session: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EventBus {
            session: session.into(),
            tx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, kind: EventKind) {
        let event = SessionEvent {
            at: Utc::now(),
            session: self.session.clone(),
            kind,
        };
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}

/// Log every event until the bus is dropped
pub async fn log_events(mut rx: broadcast::Receiver<SessionEvent>, json: bool) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if json {
                    match serde_json::to_string(&event) {
                        Ok(line) => info!(target: "kube_tunnel::event", "{}", line),
                        Err(e) => warn!("Failed to encode event: {}", e),
                    }
                } else {
                    info!(target: "kube_tunnel::event", "[{}] {}", event.kind.name(), event);
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Event logger lagged, {} events skipped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
