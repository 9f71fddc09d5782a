//! Datagram listener stub.
//!
//! Receives redirected UDP datagrams and logs them. Nothing is forwarded:
//! there is no remote datagram interface to forward to.

use ipbridge_core::BridgeResult;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{info, warn};

/// Largest datagram payload accepted.
const MAX_DATAGRAM: usize = 65536;

/// Room for the source address and ancillary data alongside the payload.
const METADATA_OVERHEAD: usize = std::mem::size_of::<libc::sockaddr_in>() + 128;

/// Logs every datagram arriving on its socket.
pub struct UdpStub {
    socket: UdpSocket,
    packets: Arc<AtomicU64>,
}

impl UdpStub {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            packets: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of datagrams received so far.
    #[cfg(test)]
    pub fn packets(&self) -> Arc<AtomicU64> {
        self.packets.clone()
    }

    /// Receive until the socket fails.
    pub async fn run(self) -> BridgeResult<()> {
        if let Ok(addr) = self.socket.local_addr() {
            info!(addr = %addr, "udp stub listening");
        }

        let mut buf = vec![0u8; MAX_DATAGRAM + METADATA_OVERHEAD];
        loop {
            let (len, peer) = self.socket.recv_from(&mut buf).await?;
            let total = self.packets.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(peer = %peer, len, total, "unhandled UDP packet received by ip-bridge");
        }
    }
}
