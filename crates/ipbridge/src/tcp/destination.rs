//! Destination resolution for intercepted connections.
//!
//! Recovers the address the client originally dialled (recorded by the
//! kernel when the connection was redirected to the bridge) and resolves it
//! to a remote [`TcpPort`] through the peer's [`IpNetwork`]: first the host
//! by its IPv4-mapped 128-bit address, then the port on that host.
//!
//! Only IPv4 originals are supported.

use ipbridge_core::{BridgeError, BridgeResult, IpAddress, IpNetwork, TcpPort};
use std::net::SocketAddrV4;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;

/// Looks up the original destination of an accepted connection.
pub type DestinationLookup = Arc<dyn Fn(&TcpStream) -> BridgeResult<SocketAddrV4> + Send + Sync>;

/// Linux kernel constant: `SO_ORIGINAL_DST` (`SOL_IP` level).
#[cfg(target_os = "linux")]
const SO_ORIGINAL_DST: libc::c_int = 80;

/// Read the pre-redirect destination via `getsockopt(SO_ORIGINAL_DST)`.
///
/// # Errors
///
/// Returns [`BridgeError::Resolution`] if the socket carries no original
/// destination (not a redirected connection) or if it is not IPv4.
#[cfg(target_os = "linux")]
pub fn original_destination(stream: &TcpStream) -> BridgeResult<SocketAddrV4> {
    use std::mem;
    use std::net::Ipv4Addr;
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    // SAFETY: `addr` is a valid, writable sockaddr_in and `len` holds its size.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
            &mut len,
        )
    };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(BridgeError::Resolution(format!(
            "getsockopt SO_ORIGINAL_DST failed: {err}"
        )));
    }
    if libc::c_int::from(addr.sin_family) != libc::AF_INET {
        return Err(BridgeError::Resolution(format!(
            "original destination has unsupported address family {}",
            addr.sin_family
        )));
    }

    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Ok(SocketAddrV4::new(ip, port))
}

#[cfg(not(target_os = "linux"))]
pub fn original_destination(_stream: &TcpStream) -> BridgeResult<SocketAddrV4> {
    Err(BridgeError::Resolution(
        "original destination lookup requires Linux".into(),
    ))
}

/// Resolve `dest` to a remote TCP port: `get_remote_host` on the mapped
/// address, then `get_tcp_port` on the result. Either failure is a
/// [`BridgeError::Resolution`]; nothing is retried.
pub async fn resolve_tcp_port(
    network: &dyn IpNetwork,
    dest: SocketAddrV4,
) -> BridgeResult<Arc<dyn TcpPort>> {
    let address = IpAddress::from_ipv4(*dest.ip());
    let host = network
        .get_remote_host(address)
        .await
        .map_err(|e| BridgeError::Resolution(format!("remote host {}: {e}", dest.ip())))?;
    let port = host
        .get_tcp_port(dest.port())
        .await
        .map_err(|e| BridgeError::Resolution(format!("remote port {dest}: {e}")))?;
    debug!(dest = %dest, "resolved remote tcp port");
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use ipbridge_core::{BoxFuture, ByteStream, IpRemoteHost};
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    struct NoPort;

    impl TcpPort for NoPort {
        fn connect(
            &self,
            _downstream: Arc<dyn ByteStream>,
        ) -> BoxFuture<'static, BridgeResult<Arc<dyn ByteStream>>> {
            futures_util::future::ready(Err(BridgeError::Other("unused".into()))).boxed()
        }
    }

    #[derive(Default)]
    struct Recorder {
        hosts: Mutex<Vec<IpAddress>>,
        ports: Arc<Mutex<Vec<u16>>>,
        fail_host: bool,
        fail_port: bool,
    }

    struct Host {
        ports: Arc<Mutex<Vec<u16>>>,
        fail: bool,
    }

    impl IpRemoteHost for Host {
        fn get_tcp_port(&self, port: u16) -> BoxFuture<'static, BridgeResult<Arc<dyn TcpPort>>> {
            self.ports.lock().unwrap().push(port);
            let result: BridgeResult<Arc<dyn TcpPort>> = if self.fail {
                Err(BridgeError::Remote("port closed".into()))
            } else {
                Ok(Arc::new(NoPort))
            };
            futures_util::future::ready(result).boxed()
        }
    }

    impl IpNetwork for Recorder {
        fn get_remote_host(
            &self,
            address: IpAddress,
        ) -> BoxFuture<'static, BridgeResult<Arc<dyn IpRemoteHost>>> {
            self.hosts.lock().unwrap().push(address);
            let result: BridgeResult<Arc<dyn IpRemoteHost>> = if self.fail_host {
                Err(BridgeError::Remote("unreachable".into()))
            } else {
                Ok(Arc::new(Host {
                    ports: self.ports.clone(),
                    fail: self.fail_port,
                }))
            };
            futures_util::future::ready(result).boxed()
        }
    }

    #[tokio::test]
    async fn resolves_host_then_port() {
        let network = Recorder::default();
        let dest: SocketAddrV4 = "192.0.2.10:443".parse().unwrap();
        resolve_tcp_port(&network, dest).await.unwrap();

        assert_eq!(
            *network.hosts.lock().unwrap(),
            vec![IpAddress {
                upper64: 0,
                lower64: 0x0000_FFFF_C000_020A
            }]
        );
        assert_eq!(*network.ports.lock().unwrap(), vec![443]);
    }

    #[tokio::test]
    async fn host_failure_skips_port_lookup() {
        let network = Recorder {
            fail_host: true,
            ..Default::default()
        };
        let result = resolve_tcp_port(&network, "10.0.0.1:80".parse().unwrap()).await;
        assert!(matches!(result, Err(BridgeError::Resolution(_))));
        assert!(network.ports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn port_failure_is_resolution_error() {
        let network = Recorder {
            fail_port: true,
            ..Default::default()
        };
        let result = resolve_tcp_port(&network, "10.0.0.1:80".parse().unwrap()).await;
        match result {
            Err(BridgeError::Resolution(msg)) => assert!(msg.contains("10.0.0.1:80"), "{msg}"),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn unredirected_socket_has_no_foreign_destination() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        // Without a redirect the kernel either has no record or reports
        // the socket's own local address.
        match original_destination(&server) {
            Ok(dest) => assert_eq!(std::net::SocketAddr::V4(dest), addr),
            Err(e) => assert!(matches!(e, BridgeError::Resolution(_))),
        }
    }
}
