//! Per-connection handling: dial the remote, then hand the pair to the relay.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::inspector::Inspector;
use crate::relay::{ConnectionPair, Relay};

/// Shared, read-only state for every connection handler.
#[derive(Clone)]
pub(crate) struct ConnectionDispatcher {
    remote_addr: SocketAddr,
    inspector: Inspector,
    relay: Arc<dyn Relay>,
}

impl ConnectionDispatcher {
    pub(crate) fn new(remote_addr: SocketAddr, inspector: Inspector, relay: Arc<dyn Relay>) -> Self {
        Self {
            remote_addr,
            inspector,
            relay,
        }
    }

    /// Handle one accepted connection. A dial failure drops the client
    /// connection and is only logged; it is never retried.
    pub(crate) async fn dispatch(&self, client: TcpStream, client_addr: SocketAddr) {
        let listen_addr = match client.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                debug!(client_addr = %client_addr, error = %e, "Client connection gone before dial");
                return;
            }
        };

        let upstream = match TcpStream::connect(self.remote_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(
                    error = %e,
                    client_addr = %client_addr,
                    proxy_listen_addr = %listen_addr,
                    remote_addr = %self.remote_addr,
                    "Remote dial failed"
                );
                drop(client);
                return;
            }
        };

        debug!(
            client_addr = %client_addr,
            remote_addr = %self.remote_addr,
            "Remote connected"
        );

        let pair = ConnectionPair {
            client,
            upstream,
            client_addr,
            listen_addr,
            remote_addr: self.remote_addr,
        };
        self.relay.relay(pair, self.inspector).await;
    }
}
