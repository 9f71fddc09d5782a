//! Capability-RPC wire messages.
//!
//! Three message kinds travel in each direction:
//!
//! - `Call` invokes `method` on capability `target`, which is always an
//!   object exported by the *receiver* of the call. Capability `0` is the
//!   peer's bootstrap [`IpNetwork`](crate::capability::IpNetwork).
//! - `Return` answers the call with the same `question` number.
//! - `Release` tells the receiver that the sender no longer references one
//!   of the receiver's exports.
//!
//! Capability numbers carried *inside* a message (`Outcome::Capability`,
//! `Method::Connect::downstream`) name objects exported by the sender.

use serde::{Deserialize, Serialize};

/// Capability number of the peer's bootstrap network object.
pub const BOOTSTRAP_CAP: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    Call {
        question: u64,
        target: u64,
        method: Method,
    },
    Return {
        question: u64,
        outcome: Outcome,
    },
    Release {
        cap: u64,
    },
}

/// Methods of the remote network interface plus the byte-stream sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// [`IpNetwork::get_remote_host`](crate::capability::IpNetwork::get_remote_host).
    GetRemoteHost { upper64: u64, lower64: u64 },
    /// [`IpRemoteHost::get_tcp_port`](crate::capability::IpRemoteHost::get_tcp_port).
    GetTcpPort { port: u16 },
    /// `TcpPort::connect`; `downstream` is exported by the caller.
    Connect { downstream: u64 },
    /// `ByteStream::write`.
    Write {
        #[serde(with = "bytes")]
        data: Vec<u8>,
    },
    /// `ByteStream::done`.
    Done,
}

impl Method {
    /// Short method name for log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Method::GetRemoteHost { .. } => "get_remote_host",
            Method::GetTcpPort { .. } => "get_tcp_port",
            Method::Connect { .. } => "connect",
            Method::Write { .. } => "write",
            Method::Done => "done",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Void,
    Capability { cap: u64 },
    Exception { reason: String },
}

/// Encode `Vec<u8>` as a CBOR byte string instead of an array of integers.
mod bytes {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BytesVisitor;

        impl<'de> serde::de::Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a byte string")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(v)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    bytes.push(b);
                }
                Ok(bytes)
            }
        }

        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}
