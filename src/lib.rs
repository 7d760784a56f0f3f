//! kube-tunnel - Reach a Kubernetes cluster network from a local machine
//!
//! A session provisions (or reuses) a shadow pod running a SOCKS server,
//! forwards a local port to it, and routes local traffic into that tunnel
//! using one of three methods:
//! - Proxy: SOCKS endpoint, optionally registered as the process proxy
//! - FullTunnel: routes for every inferred cluster range
//! - Mesh: service names mapped to loopback relays into the tunnel
//!
//! # Architecture
//!
//! ```text
//!                     +----------------+
//!                     |   session/     |
//!                     |  (supervisor)  |
//!                     +-------+--------+
//!                             |
//!        +--------------------+--------------------+
//!        |                    |                    |
//! +------v------+     +-------v-------+    +------v------+
//! |   shadow/   |     |  transport/   |    |  connect/   |
//! | (provision) |     | (port-forward)|    | (strategies)|
//! +------+------+     +-------+-------+    +------+------+
//!        |                    |                   |
//! +------v------+             |            +------v------+
//! |  cluster/   <-------------+            |   system/   |
//! | (gateway,   |                          | (proxy, dns,|
//! |   cidr)     |                          |   routes)   |
//! +-------------+                          +-------------+
//! ```

pub mod cluster;
pub mod common;
pub mod config;
pub mod connect;
pub mod session;
pub mod shadow;
pub mod system;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use common::error::{Error, ErrorKind, Result, Stage};
pub use common::event::{EventBus, EventKind, SessionEvent};
pub use config::Config;
pub use session::{SessionDeps, SessionLock, SessionState, SessionSupervisor};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "0.3.0");
    }
}
