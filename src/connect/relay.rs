//! Loopback relays: each accepted connection is carried through the tunnel's
//! SOCKS endpoint to a fixed cluster address

use crate::common::net::configure_tcp_stream;
use crate::common::socks;
use crate::{Error, Result};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A listening relay; stops accepting (and drops its connections) once `cancel` fires
pub(super) struct Relay {
    pub listen: SocketAddr,
    pub target: SocketAddr,
    task: JoinHandle<()>,
}

impl Relay {
    pub async fn spawn(
        listen: SocketAddr,
        target: SocketAddr,
        proxy: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| Error::system(format!("cannot listen on {}: {}", listen, e)))?;
        debug!("Relay {} -> {} via {}", listen, target, proxy);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            configure_tcp_stream(&stream);
                            let stop = cancel.child_token();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = stop.cancelled() => {}
                                    res = Self::handle_connection(stream, proxy, target) => {
                                        if let Err(e) = res {
                                            debug!("Relay connection from {} to {} failed: {}", peer, target, e);
                                        }
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Relay on {} stopped accepting: {}", listen, e);
                            break;
                        }
                    }
                }
            }
        });

        Ok(Relay {
            listen,
            target,
            task,
        })
    }

    async fn handle_connection(mut client: TcpStream, proxy: SocketAddr, target: SocketAddr) -> Result<()> {
        let mut upstream = TcpStream::connect(proxy).await?;
        configure_tcp_stream(&upstream);
        socks::connect(&mut upstream, target).await?;

        let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        debug!("Relay to {} completed (sent: {}, received: {})", target, sent, received);
        Ok(())
    }

    /// Wait for the accept loop to finish; the listener is closed afterwards
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("Relay on {} panicked: {}", self.listen, e);
        }
    }
}
