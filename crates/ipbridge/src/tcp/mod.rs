//! TCP bridging: intercepted local connections to remote TCP ports.
//!
//! # Submodule Architecture
//!
//! - **[`acceptor`]**: The [`TcpBridge`] accept loop. Assigns each
//!   connection an id and bridges it in its own task.
//!
//! - **[`destination`]**: Recovers the connection's original destination
//!   and resolves it to a remote [`TcpPort`](ipbridge_core::TcpPort) via
//!   `get_remote_host` then `get_tcp_port`.
//!
//! - **[`downstream`]**: The
//!   [`DownstreamWriter`](downstream::DownstreamWriter) exported to the
//!   peer, a FIFO write queue over the socket's write half.
//!
//! - **[`upstream`]**: The
//!   [`UpstreamForwarder`](upstream::UpstreamForwarder) read loop, with at
//!   most four unacknowledged write calls in flight.
//!
//! - **[`supervisor`]**: [`TaskSupervisor`](supervisor::TaskSupervisor)
//!   and [`ReadAbort`](supervisor::ReadAbort). Tracks a connection's
//!   in-flight calls and aborts its reads on the first failure.
//!
//! # Data Flow
//!
//! ```text
//! local client ──read──► UpstreamForwarder ──write/done──► remote upstream
//! local client ◄─write── DownstreamWriter  ◄─write/done─── remote peer
//! ```

pub mod acceptor;
pub mod destination;
pub mod downstream;
pub mod supervisor;
pub mod upstream;

pub use acceptor::TcpBridge;
