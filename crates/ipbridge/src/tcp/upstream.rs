//! Local→remote forwarding with bounded read-ahead.
//!
//! The forwarder reads up to [`BUFFER_SIZE`] bytes at a time from the local
//! socket and issues one `write` call per chunk on the remote upstream
//! stream without waiting for it to be acknowledged. At most
//! [`MAX_PARALLEL_WRITES`] calls may be outstanding; when the limit is
//! reached the loop suspends (holding the chunk it just read) until a call
//! completes. Unacknowledged data is therefore capped at
//! `MAX_PARALLEL_WRITES * BUFFER_SIZE` bytes per connection.
//!
//! Writes run under the connection's [`TaskSupervisor`]: a failed write
//! aborts the read side once, and the loop ends with
//! [`BridgeError::ReadAborted`].

use super::supervisor::{ReadAbort, TaskSupervisor};
use ipbridge_core::{BridgeError, BridgeResult, ByteStream};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Semaphore;
use tracing::debug;

/// Size of the local read buffer, and so the largest chunk per write call.
pub const BUFFER_SIZE: usize = 8192;

/// Maximum number of unacknowledged upstream write calls per connection.
pub const MAX_PARALLEL_WRITES: usize = 4;

/// Pumps one local read half into a remote [`ByteStream`].
pub struct UpstreamForwarder<R> {
    conn_id: u64,
    reader: R,
    upstream: Arc<dyn ByteStream>,
    buffer: Box<[u8]>,
    /// One permit per write slot; a permit travels with each outstanding call.
    slots: Arc<Semaphore>,
    supervisor: TaskSupervisor,
}

impl<R> UpstreamForwarder<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(conn_id: u64, reader: R, upstream: Arc<dyn ByteStream>) -> Self {
        let abort = Arc::new(ReadAbort::new());
        Self {
            conn_id,
            reader,
            upstream,
            buffer: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
            slots: Arc::new(Semaphore::new(MAX_PARALLEL_WRITES)),
            supervisor: TaskSupervisor::new(conn_id, abort),
        }
    }

    /// The read-side abort signal shared with this forwarder's supervisor.
    #[cfg(test)]
    pub fn abort_handle(&self) -> Arc<ReadAbort> {
        self.supervisor.abort().clone()
    }

    /// Run until local EOF (after sending `done`) or until the read side
    /// fails or is aborted. Returns the number of bytes handed to `write`.
    ///
    /// Write calls already issued are awaited before returning, whatever
    /// the outcome.
    pub async fn run(mut self) -> BridgeResult<u64> {
        let result = self.pump().await;
        let in_flight = self.supervisor.in_flight();
        self.supervisor.join().await;
        debug!(
            conn_id = self.conn_id,
            in_flight,
            failures = self.supervisor.failures(),
            "upstream writes drained"
        );
        result
    }

    async fn pump(&mut self) -> BridgeResult<u64> {
        let conn_id = self.conn_id;
        let abort = self.supervisor.abort().clone();
        let mut forwarded: u64 = 0;

        loop {
            let n = tokio::select! {
                biased;
                _ = abort.aborted() => return Err(BridgeError::ReadAborted),
                read = self.reader.read(&mut self.buffer) => read?,
            };

            if n == 0 {
                debug!(conn_id, forwarded, "local EOF, sending done upstream");
                self.upstream.done().await?;
                return Ok(forwarded);
            }

            let permit = tokio::select! {
                biased;
                _ = abort.aborted() => return Err(BridgeError::ReadAborted),
                permit = self.slots.clone().acquire_owned() => permit
                    .map_err(|_| BridgeError::Other("write slots closed".into()))?,
            };

            let write = self.upstream.write(self.buffer[..n].to_vec());
            forwarded += n as u64;
            self.supervisor.spawn_guarded("write", permit, write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use ipbridge_core::BoxFuture;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, ReadBuf};
    use tokio::sync::oneshot;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Write(usize),
        Done,
    }

    /// Upstream sink whose write calls complete only when the test says so.
    #[derive(Default)]
    struct GatedSink {
        events: Mutex<Vec<Event>>,
        pending: Mutex<Vec<Option<oneshot::Sender<BridgeResult<()>>>>>,
    }

    impl GatedSink {
        fn writes(&self) -> usize {
            self.pending.lock().unwrap().len()
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn complete(&self, index: usize, result: BridgeResult<()>) {
            let tx = self.pending.lock().unwrap()[index]
                .take()
                .expect("write already completed");
            let _ = tx.send(result);
        }
    }

    impl ByteStream for GatedSink {
        fn write(&self, data: Vec<u8>) -> BoxFuture<'static, BridgeResult<()>> {
            let (tx, rx) = oneshot::channel();
            self.events.lock().unwrap().push(Event::Write(data.len()));
            self.pending.lock().unwrap().push(Some(tx));
            async move { rx.await.unwrap_or(Err(BridgeError::Disconnected)) }.boxed()
        }

        fn done(&self) -> BoxFuture<'static, BridgeResult<()>> {
            self.events.lock().unwrap().push(Event::Done);
            futures_util::future::ready(Ok(())).boxed()
        }
    }

    /// Counts completed reads on the wrapped reader.
    struct CountingReader<R> {
        inner: R,
        reads: Arc<AtomicUsize>,
    }

    impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
            if poll.is_ready() {
                self.reads.fetch_add(1, Ordering::SeqCst);
            }
            poll
        }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    async fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn read_ahead_is_capped_at_four_writes() {
        let (mut client, local) = tokio::io::duplex(16 * BUFFER_SIZE);
        client.write_all(&vec![7u8; 10 * BUFFER_SIZE]).await.unwrap();

        let sink = Arc::new(GatedSink::default());
        let forwarder = UpstreamForwarder::new(1, local, sink.clone());
        let run = tokio::spawn(forwarder.run());

        wait_for("four writes", || sink.writes() == 4).await;
        settle().await;
        assert_eq!(sink.writes(), 4, "fifth write must wait for a free slot");
        assert!(sink.events().iter().all(|e| *e == Event::Write(BUFFER_SIZE)));

        sink.complete(0, Ok(()));
        wait_for("fifth write", || sink.writes() == 5).await;
        settle().await;
        assert_eq!(sink.writes(), 5);

        // Drain the rest one completion at a time; never more than four pending.
        for i in 1..10 {
            sink.complete(i, Ok(()));
            wait_for("next write", || sink.writes() >= (i + 5).min(10)).await;
            let pending = sink
                .pending
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.is_some())
                .count();
            assert!(pending <= MAX_PARALLEL_WRITES, "{pending} writes outstanding");
        }

        drop(client);
        let forwarded = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("forwarder did not finish")
            .unwrap()
            .unwrap();
        assert_eq!(forwarded, (10 * BUFFER_SIZE) as u64);
        assert_eq!(sink.events().last(), Some(&Event::Done));
    }

    #[tokio::test]
    async fn immediate_eof_sends_only_done() {
        let (client, local) = tokio::io::duplex(1024);
        drop(client);

        let sink = Arc::new(GatedSink::default());
        let forwarded = UpstreamForwarder::new(2, local, sink.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(forwarded, 0);
        assert_eq!(sink.events(), vec![Event::Done]);
    }

    #[tokio::test]
    async fn done_is_last_and_sent_once() {
        let (mut client, local) = tokio::io::duplex(1024);
        let sink = Arc::new(GatedSink::default());
        let run = tokio::spawn(UpstreamForwarder::new(3, local, sink.clone()).run());

        client.write_all(b"hello").await.unwrap();
        wait_for("first write", || sink.writes() == 1).await;
        client.write_all(b"world").await.unwrap();
        wait_for("second write", || sink.writes() == 2).await;
        client.shutdown().await.unwrap();

        wait_for("done", || sink.events().contains(&Event::Done)).await;
        sink.complete(0, Ok(()));
        sink.complete(1, Ok(()));
        assert_eq!(run.await.unwrap().unwrap(), 10);
        assert_eq!(
            sink.events(),
            vec![Event::Write(5), Event::Write(5), Event::Done]
        );
    }

    #[tokio::test]
    async fn failed_write_aborts_reads_once() {
        let (mut client, local) = tokio::io::duplex(16 * BUFFER_SIZE);
        client.write_all(&vec![1u8; 10 * BUFFER_SIZE]).await.unwrap();

        let reads = Arc::new(AtomicUsize::new(0));
        let reader = CountingReader {
            inner: local,
            reads: reads.clone(),
        };
        let sink = Arc::new(GatedSink::default());
        let forwarder = UpstreamForwarder::new(4, reader, sink.clone());
        let abort = forwarder.abort_handle();
        let run = tokio::spawn(forwarder.run());

        wait_for("four writes", || sink.writes() == 4).await;
        // Four chunks written plus the fifth read ahead.
        wait_for("read ahead", || reads.load(Ordering::SeqCst) == 5).await;

        sink.complete(1, Err(BridgeError::Remote("sink closed".into())));
        wait_for("abort", || abort.is_aborted()).await;
        settle().await;
        assert_eq!(reads.load(Ordering::SeqCst), 5, "no reads after abort");
        assert_eq!(sink.writes(), 4, "no writes after abort");
        assert!(!abort.trigger(), "abort happened exactly once");

        // The other writes run to completion; only then does run() return.
        sink.complete(0, Ok(()));
        sink.complete(2, Err(BridgeError::Remote("sink closed".into())));
        sink.complete(3, Ok(()));
        let result = run.await.unwrap();
        assert!(matches!(result, Err(BridgeError::ReadAborted)));
        assert!(!sink.events().contains(&Event::Done));
    }
}
