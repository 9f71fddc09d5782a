//! Accept loop for intercepted TCP connections.
//!
//! Each accepted connection is bridged independently in its own task:
//!
//! ```text
//! accept
//!   → lookup original destination
//!   → resolve_tcp_port (get_remote_host, get_tcp_port)
//!   → split socket; export the write half as a DownstreamWriter
//!   → TcpPort::connect(downstream) → upstream ByteStream
//!   → UpstreamForwarder pumps the read half until EOF or abort
//! ```
//!
//! A failure anywhere in that chain closes only the affected connection.

use super::destination::{original_destination, resolve_tcp_port, DestinationLookup};
use super::downstream::DownstreamWriter;
use super::upstream::UpstreamForwarder;
use ipbridge_core::{BridgeError, BridgeResult, ByteStream, IpNetwork};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Bridges intercepted TCP connections onto a remote [`IpNetwork`].
pub struct TcpBridge {
    network: Arc<dyn IpNetwork>,
    lookup: DestinationLookup,
    next_conn_id: AtomicU64,
}

impl TcpBridge {
    /// A bridge that reads each connection's destination from the kernel.
    pub fn new(network: Arc<dyn IpNetwork>) -> Self {
        Self::with_lookup(network, Arc::new(original_destination))
    }

    /// A bridge with a custom destination lookup.
    pub fn with_lookup(network: Arc<dyn IpNetwork>, lookup: DestinationLookup) -> Self {
        Self {
            network,
            lookup,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Accept connections on `listener` until accepting fails.
    ///
    /// Per-connection failures are logged and do not stop the loop; an
    /// accept error ends it with [`BridgeError::Listener`].
    pub async fn run(&self, listener: TcpListener) -> BridgeResult<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "tcp bridge listening");
        }

        loop {
            let (stream, peer) = listener.accept().await.map_err(BridgeError::Listener)?;
            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            debug!(conn_id, peer = %peer, "accepted connection");

            let network = self.network.clone();
            let lookup = self.lookup.clone();
            tokio::spawn(async move {
                match bridge_connection(conn_id, stream, network, lookup).await {
                    Ok(forwarded) => debug!(conn_id, forwarded, "connection finished"),
                    Err(BridgeError::ReadAborted) => {
                        debug!(conn_id, "connection closed after upstream write failure")
                    }
                    Err(e) => warn!(conn_id, error = %e, "connection failed"),
                }
            });
        }
    }
}

async fn bridge_connection(
    conn_id: u64,
    stream: TcpStream,
    network: Arc<dyn IpNetwork>,
    lookup: DestinationLookup,
) -> BridgeResult<u64> {
    let dest = lookup(&stream)?;
    let port = resolve_tcp_port(network.as_ref(), dest).await?;

    let (read_half, write_half) = stream.into_split();
    let downstream: Arc<dyn ByteStream> = Arc::new(DownstreamWriter::spawn(conn_id, write_half));
    let upstream = port
        .connect(downstream)
        .await
        .map_err(|e| BridgeError::Resolution(format!("connect to {dest}: {e}")))?;
    info!(conn_id, dest = %dest, "connection bridged");

    UpstreamForwarder::new(conn_id, read_half, upstream).run().await
}
