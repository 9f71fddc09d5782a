//! Capability-RPC session over a duplex byte stream.
//!
//! [`RpcSession::start`] spawns one IO task that owns the stream. Outgoing
//! calls are queued on an unbounded channel at the moment the capability
//! method is invoked, so the peer sees calls in invocation order. Incoming
//! frames are decoded and dispatched in arrival order:
//!
//! - `Return` completes the matching pending question.
//! - `Call` on one of our exports (the downstream sinks handed out through
//!   `connect`) invokes the sink synchronously from the IO task, then a
//!   spawned task awaits the result and sends the `Return`.
//! - `Release` drops the export.
//!
//! When the stream ends every pending question fails with
//! [`BridgeError::Disconnected`] and all exports are dropped.

use crate::address::IpAddress;
use crate::capability::{BoxFuture, ByteStream, IpNetwork, IpRemoteHost, TcpPort};
use crate::codec::{frame_encode, FrameDecoder};
use crate::error::{BridgeError, BridgeResult};
use crate::messages::{Message, Method, Outcome, BOOTSTRAP_CAP};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Client end of a capability-RPC session.
///
/// Cheap to clone; all clones share the same IO task.
#[derive(Clone)]
pub struct RpcSession {
    shared: Arc<Shared>,
}

struct Shared {
    /// Frames waiting for the IO task.
    outgoing: mpsc::UnboundedSender<Message>,
    /// Pending questions: question number to answer slot.
    questions: Mutex<HashMap<u64, oneshot::Sender<Outcome>>>,
    /// Objects we export to the peer, keyed by capability number.
    exports: Mutex<HashMap<u64, Arc<dyn ByteStream>>>,
    next_question: AtomicU64,
    next_export: AtomicU64,
    closed: AtomicBool,
}

impl RpcSession {
    /// Start a session on `stream` and return it with its IO task handle.
    ///
    /// The IO task resolves when the peer closes the stream (`Ok`) or on a
    /// transport or framing error.
    pub fn start<S>(stream: S) -> (Self, JoinHandle<BridgeResult<()>>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            outgoing,
            questions: Mutex::new(HashMap::new()),
            exports: Mutex::new(HashMap::new()),
            next_question: AtomicU64::new(1),
            next_export: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        let io = tokio::spawn(shared.clone().run(stream, outgoing_rx));
        (Self { shared }, io)
    }

    /// The peer's bootstrap network capability.
    pub fn network(&self) -> Arc<dyn IpNetwork> {
        Arc::new(RemoteNetwork(RemoteCap {
            shared: self.shared.clone(),
            cap: BOOTSTRAP_CAP,
        }))
    }

    /// Number of objects currently exported to the peer.
    pub fn export_count(&self) -> usize {
        lock(&self.shared.exports).len()
    }

    /// Whether the IO task has shut the session down.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Shared {
    async fn run<S>(
        self: Arc<Self>,
        stream: S,
        mut outgoing_rx: mpsc::UnboundedReceiver<Message>,
    ) -> BridgeResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let result = loop {
            tokio::select! {
                Some(msg) = outgoing_rx.recv() => {
                    if let Err(e) = send_frame(&mut writer, &msg).await {
                        break Err(e);
                    }
                }
                read = reader.read(&mut buf) => {
                    match read {
                        Ok(0) => {
                            debug!("rpc peer closed the session");
                            break Ok(());
                        }
                        Ok(n) => match decoder.feed::<Message>(&buf[..n]) {
                            Ok(messages) => {
                                for msg in messages {
                                    self.dispatch(msg);
                                }
                            }
                            Err(e) => break Err(e),
                        },
                        Err(e) => break Err(e.into()),
                    }
                }
            }
        };

        self.disconnect();
        if let Err(e) = &result {
            warn!(error = %e, "rpc session failed");
        }
        result
    }

    fn dispatch(self: &Arc<Self>, msg: Message) {
        match msg {
            Message::Return { question, outcome } => {
                let waiter = lock(&self.questions).remove(&question);
                match waiter {
                    Some(tx) => {
                        // The caller may have stopped waiting; that is fine.
                        let _ = tx.send(outcome);
                    }
                    None => warn!(question, "return for unknown question"),
                }
            }
            Message::Call {
                question,
                target,
                method,
            } => self.handle_call(question, target, method),
            Message::Release { cap } => {
                if lock(&self.exports).remove(&cap).is_some() {
                    debug!(cap, "export released by peer");
                }
            }
        }
    }

    fn handle_call(self: &Arc<Self>, question: u64, target: u64, method: Method) {
        let sink = lock(&self.exports).get(&target).cloned();
        let Some(sink) = sink else {
            warn!(question, target, method = method.name(), "call on unknown capability");
            self.reply(
                question,
                Outcome::Exception {
                    reason: format!("unknown capability {target}"),
                },
            );
            return;
        };

        // Invoked here, in arrival order; only the completion is deferred.
        let call = match method {
            Method::Write { data } => sink.write(data),
            Method::Done => sink.done(),
            other => {
                self.reply(
                    question,
                    Outcome::Exception {
                        reason: format!("{} is not a byte stream method", other.name()),
                    },
                );
                return;
            }
        };

        let shared = self.clone();
        tokio::spawn(async move {
            let outcome = match call.await {
                Ok(()) => Outcome::Void,
                Err(e) => Outcome::Exception {
                    reason: e.to_string(),
                },
            };
            shared.reply(question, outcome);
        });
    }

    fn reply(&self, question: u64, outcome: Outcome) {
        if self
            .outgoing
            .send(Message::Return { question, outcome })
            .is_err()
        {
            debug!(question, "session closed before return could be sent");
        }
    }

    /// Issue a call now; the future resolves with the peer's answer.
    fn call(&self, target: u64, method: Method) -> BoxFuture<'static, BridgeResult<Outcome>> {
        let question = self.next_question.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut questions = lock(&self.questions);
            if self.closed.load(Ordering::Acquire) {
                return futures_util::future::ready(Err(BridgeError::Disconnected)).boxed();
            }
            questions.insert(question, tx);
        }

        if self
            .outgoing
            .send(Message::Call {
                question,
                target,
                method,
            })
            .is_err()
        {
            lock(&self.questions).remove(&question);
            return futures_util::future::ready(Err(BridgeError::Disconnected)).boxed();
        }

        async move {
            match rx.await {
                Ok(Outcome::Exception { reason }) => Err(BridgeError::Remote(reason)),
                Ok(outcome) => Ok(outcome),
                Err(_) => Err(BridgeError::Disconnected),
            }
        }
        .boxed()
    }

    fn export(&self, sink: Arc<dyn ByteStream>) -> u64 {
        let cap = self.next_export.fetch_add(1, Ordering::Relaxed);
        if !self.closed.load(Ordering::Acquire) {
            lock(&self.exports).insert(cap, sink);
        }
        cap
    }

    fn unexport(&self, cap: u64) {
        lock(&self.exports).remove(&cap);
    }

    fn release(&self, cap: u64) {
        // Nothing to tell a peer that is already gone.
        let _ = self.outgoing.send(Message::Release { cap });
    }

    fn disconnect(&self) {
        self.closed.store(true, Ordering::Release);
        let pending = std::mem::take(&mut *lock(&self.questions));
        if !pending.is_empty() {
            debug!(count = pending.len(), "failing pending questions");
        }
        drop(pending);
        let exports = std::mem::take(&mut *lock(&self.exports));
        drop(exports);
    }
}

async fn send_frame<S: AsyncWrite>(writer: &mut WriteHalf<S>, msg: &Message) -> BridgeResult<()> {
    let frame = frame_encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn expect_capability(outcome: Outcome, method: &'static str) -> BridgeResult<u64> {
    match outcome {
        Outcome::Capability { cap } => Ok(cap),
        other => Err(BridgeError::InvalidMessage(format!(
            "{method} returned {other:?} instead of a capability"
        ))),
    }
}

fn expect_void(outcome: Outcome, method: &'static str) -> BridgeResult<()> {
    match outcome {
        Outcome::Void => Ok(()),
        other => Err(BridgeError::InvalidMessage(format!(
            "{method} returned {other:?} instead of void"
        ))),
    }
}

// ── Imported capabilities ────────────────────────────────────────────

/// A reference to an object exported by the peer. Dropping it releases the
/// peer's export (the bootstrap object is never released).
struct RemoteCap {
    shared: Arc<Shared>,
    cap: u64,
}

impl Drop for RemoteCap {
    fn drop(&mut self) {
        if self.cap != BOOTSTRAP_CAP {
            self.shared.release(self.cap);
        }
    }
}

struct RemoteNetwork(RemoteCap);
struct RemoteHost(RemoteCap);
struct RemoteTcpPort(RemoteCap);
struct RemoteByteStream(RemoteCap);

impl IpNetwork for RemoteNetwork {
    fn get_remote_host(
        &self,
        address: IpAddress,
    ) -> BoxFuture<'static, BridgeResult<Arc<dyn IpRemoteHost>>> {
        let shared = self.0.shared.clone();
        let call = shared.call(
            self.0.cap,
            Method::GetRemoteHost {
                upper64: address.upper64,
                lower64: address.lower64,
            },
        );
        async move {
            let cap = expect_capability(call.await?, "get_remote_host")?;
            Ok(Arc::new(RemoteHost(RemoteCap { shared, cap })) as Arc<dyn IpRemoteHost>)
        }
        .boxed()
    }
}

impl IpRemoteHost for RemoteHost {
    fn get_tcp_port(&self, port: u16) -> BoxFuture<'static, BridgeResult<Arc<dyn TcpPort>>> {
        let shared = self.0.shared.clone();
        let call = shared.call(self.0.cap, Method::GetTcpPort { port });
        async move {
            let cap = expect_capability(call.await?, "get_tcp_port")?;
            Ok(Arc::new(RemoteTcpPort(RemoteCap { shared, cap })) as Arc<dyn TcpPort>)
        }
        .boxed()
    }
}

impl TcpPort for RemoteTcpPort {
    fn connect(
        &self,
        downstream: Arc<dyn ByteStream>,
    ) -> BoxFuture<'static, BridgeResult<Arc<dyn ByteStream>>> {
        let shared = self.0.shared.clone();
        let export = shared.export(downstream);
        let call = shared.call(self.0.cap, Method::Connect { downstream: export });
        async move {
            match call.await.and_then(|o| expect_capability(o, "connect")) {
                Ok(cap) => {
                    Ok(Arc::new(RemoteByteStream(RemoteCap { shared, cap })) as Arc<dyn ByteStream>)
                }
                Err(e) => {
                    shared.unexport(export);
                    Err(e)
                }
            }
        }
        .boxed()
    }
}

impl ByteStream for RemoteByteStream {
    fn write(&self, data: Vec<u8>) -> BoxFuture<'static, BridgeResult<()>> {
        let call = self.0.shared.call(self.0.cap, Method::Write { data });
        async move { expect_void(call.await?, "write") }.boxed()
    }

    fn done(&self) -> BoxFuture<'static, BridgeResult<()>> {
        let call = self.0.shared.call(self.0.cap, Method::Done);
        async move { expect_void(call.await?, "done") }.boxed()
    }
}
