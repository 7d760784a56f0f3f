//! Network utilities

use crate::{Error, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use socket2::SockRef;
use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Ports currently bound by a tunnel session in this process
static BOUND_PORTS: Lazy<Mutex<HashSet<u16>>> = Lazy::new(|| Mutex::new(HashSet::new()));

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Loopback address for a local port
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Exclusive claim on a local port, released on drop
#[derive(Debug)]
pub struct PortLease {
    port: u16,
}

impl PortLease {
    /// Claim `port` for this process; fails if another session holds it
    pub fn acquire(port: u16) -> Result<Self> {
        if port == 0 {
            return Err(Error::config("local port must be non-zero"));
        }
        if !BOUND_PORTS.lock().insert(port) {
            return Err(Error::PortUnavailable(port));
        }
        Ok(PortLease { port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        BOUND_PORTS.lock().remove(&self.port);
    }
}

/// Bind a loopback listener, mapping "in use" to `PortUnavailable`
pub async fn bind_local(port: u16) -> Result<TcpListener> {
    TcpListener::bind(loopback(port)).await.map_err(|e| match e.kind() {
        io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied => Error::PortUnavailable(port),
        _ => Error::Io(e),
    })
}

/// Check that nothing else on the host is bound to `port`
pub async fn ensure_port_free(port: u16) -> Result<()> {
    let listener = bind_local(port).await?;
    drop(listener);
    Ok(())
}

/// Whether a connection to the local port succeeds within `wait`
pub async fn port_accepting(port: u16, wait: Duration) -> bool {
    matches!(
        timeout(wait, TcpStream::connect(loopback(port))).await,
        Ok(Ok(_))
    )
}
