//! Capability traits for the sandboxed peer's network interface.
//!
//! Every method *issues* its call before returning; the returned future only
//! waits for the answer. Callers can therefore pipeline several calls on one
//! object (the upstream forwarder relies on this for read-ahead) and the
//! calls reach the peer in the order the methods were invoked.

use crate::address::IpAddress;
use crate::error::BridgeResult;
use std::sync::Arc;

pub use futures_util::future::BoxFuture;

/// Entry point of the remote IP network.
pub trait IpNetwork: Send + Sync {
    /// Look up a remote host by its 128-bit address.
    fn get_remote_host(
        &self,
        address: IpAddress,
    ) -> BoxFuture<'static, BridgeResult<Arc<dyn IpRemoteHost>>>;
}

/// A host reachable through the remote network.
pub trait IpRemoteHost: Send + Sync {
    /// Obtain the TCP port `port` on this host.
    fn get_tcp_port(&self, port: u16) -> BoxFuture<'static, BridgeResult<Arc<dyn TcpPort>>>;
}

/// A TCP port on a remote host.
pub trait TcpPort: Send + Sync {
    /// Open a session: `downstream` receives remote→local bytes, the returned
    /// stream accepts local→remote bytes.
    fn connect(
        &self,
        downstream: Arc<dyn ByteStream>,
    ) -> BoxFuture<'static, BridgeResult<Arc<dyn ByteStream>>>;
}

/// An ordered byte-stream sink.
pub trait ByteStream: Send + Sync {
    /// Append `data` to the stream.
    fn write(&self, data: Vec<u8>) -> BoxFuture<'static, BridgeResult<()>>;

    /// No further writes will follow.
    fn done(&self) -> BoxFuture<'static, BridgeResult<()>>;
}
