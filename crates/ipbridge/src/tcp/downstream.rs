//! Remote→local writer exported to the peer as the connection's downstream
//! [`ByteStream`].
//!
//! The peer may pipeline `write` calls, but the local socket accepts one
//! write at a time. Each call is appended to a FIFO queue at the moment it
//! is invoked; a single drain task owning the socket's write half performs
//! the writes strictly in queue order and acknowledges each caller through
//! its own `oneshot`. A failed write does not stall the queue: the next
//! entry is attempted after it, and every caller learns only its own result.
//!
//! `done` is queued like a write, so it takes effect after every write
//! issued before it, and half-closes the outbound direction only.

use futures_util::FutureExt;
use ipbridge_core::{BoxFuture, BridgeError, BridgeResult, ByteStream};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

enum WriteOp {
    Write(Vec<u8>, oneshot::Sender<BridgeResult<()>>),
    Done(oneshot::Sender<BridgeResult<()>>),
}

/// Serializes remote write/done calls onto one local write half.
pub struct DownstreamWriter {
    queue: mpsc::UnboundedSender<WriteOp>,
}

impl DownstreamWriter {
    /// Start the drain task for `writer`.
    ///
    /// The task, and with it the write half, lives until every handle to
    /// this writer has been dropped and the queue is empty.
    pub fn spawn<W>(conn_id: u64, writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        tokio::spawn(drain(conn_id, writer, queue_rx));
        Self { queue }
    }

    fn enqueue(
        &self,
        op: impl FnOnce(oneshot::Sender<BridgeResult<()>>) -> WriteOp,
    ) -> BoxFuture<'static, BridgeResult<()>> {
        let (ack, ack_rx) = oneshot::channel();
        if self.queue.send(op(ack)).is_err() {
            return futures_util::future::ready(Err(BridgeError::Other(
                "local connection writer has stopped".into(),
            )))
            .boxed();
        }
        async move {
            ack_rx.await.unwrap_or_else(|_| {
                Err(BridgeError::Other("local connection writer has stopped".into()))
            })
        }
        .boxed()
    }
}

impl ByteStream for DownstreamWriter {
    fn write(&self, data: Vec<u8>) -> BoxFuture<'static, BridgeResult<()>> {
        self.enqueue(|ack| WriteOp::Write(data, ack))
    }

    fn done(&self) -> BoxFuture<'static, BridgeResult<()>> {
        self.enqueue(WriteOp::Done)
    }
}

async fn drain<W>(conn_id: u64, mut writer: W, mut queue: mpsc::UnboundedReceiver<WriteOp>)
where
    W: AsyncWrite + Unpin,
{
    let mut shut = false;
    let mut written: u64 = 0;

    while let Some(op) = queue.recv().await {
        match op {
            WriteOp::Write(data, ack) => {
                let result = if shut {
                    Err(BridgeError::Other("write after done".into()))
                } else {
                    writer.write_all(&data).await.map_err(BridgeError::from)
                };
                match &result {
                    Ok(()) => written += data.len() as u64,
                    Err(e) => warn!(conn_id, error = %e, "local write failed"),
                }
                let _ = ack.send(result);
            }
            WriteOp::Done(ack) => {
                let result = if shut {
                    Ok(())
                } else {
                    shut = true;
                    debug!(conn_id, written, "downstream done, shutting down local writes");
                    writer.shutdown().await.map_err(BridgeError::from)
                };
                let _ = ack.send(result);
            }
        }
    }

    debug!(conn_id, written, "downstream writer released");
}
