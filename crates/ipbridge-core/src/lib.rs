//! ipbridge-core: shared protocol library for the IP bridge.
//!
//! Provides the capability traits describing the sandboxed peer's network
//! interface, CBOR RPC messages and codec, the 128-bit address type, and an
//! RPC session implementing the traits over any duplex byte stream.

pub mod address;
pub mod capability;
pub mod codec;
pub mod error;
pub mod messages;
pub mod session;

// Re-export commonly used items at crate root.
pub use address::IpAddress;
pub use capability::{BoxFuture, ByteStream, IpNetwork, IpRemoteHost, TcpPort};
pub use codec::{cbor_decode, frame_encode, FrameDecoder};
pub use error::{BridgeError, BridgeResult};
pub use session::RpcSession;
