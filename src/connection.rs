//! A single pipelined RESP connection.
//!
//! Grounded on the same split as a framed mini-redis style `Connection`
//! (buffer in, `Decoder::gets` out) but generalized from "one request, one
//! reply, strictly alternating" into full pipelining: a reader task and a
//! writer task own the socket's two halves independently, correlating
//! replies to callers through a shared FIFO of completion slots rather
//! than the connection itself ever awaiting a reply in the caller's
//! future.
//!
//! Callers never touch the socket. `execute` hands the writer task a
//! command and a `oneshot` completion slot, and only awaits that slot --
//! any number of other callers can be doing the same concurrently, and the
//! writer serializes their commands onto the wire back to back without
//! waiting for replies in between.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, Notify};

use crate::decoder::{Decoder, Value};
use crate::encoder::{encode_command, Arg};
use crate::error::{RespError, RespResult};
use crate::pubsub::Message;

const READ_BUF_SIZE: usize = 16 * 1024;

type CompletionSlot = oneshot::Sender<RespResult<Value>>;

enum WriteJob {
    /// A request awaiting a reply; the writer pushes `completion` onto the
    /// shared in-flight FIFO only after the bytes are fully written, so
    /// the FIFO order always matches wire order.
    Request { bytes: bytes::Bytes, completion: CompletionSlot },
    /// `SUBSCRIBE`/`UNSUBSCRIBE` and friends: no reply slot, because once
    /// issued the connection is in pub/sub mode and every subsequent
    /// server push (including the subscribe confirmation itself) is
    /// routed to the pub/sub dispatcher, not the FIFO.
    Fire { bytes: bytes::Bytes },
}

/// A TCP connection speaking RESP2, with full pipelining.
pub struct Connection {
    write_tx: mpsc::UnboundedSender<WriteJob>,
    in_flight_count: Arc<AtomicUsize>,
    subscribed: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    close_signal: Arc<Notify>,
    pubsub_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
}

impl Connection {
    /// Opens a TCP connection and spawns its reader and writer tasks.
    pub async fn open<A: ToSocketAddrs>(addr: A) -> RespResult<Connection> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let in_flight: Arc<Mutex<VecDeque<CompletionSlot>>> = Arc::new(Mutex::new(VecDeque::new()));
        let in_flight_count = Arc::new(AtomicUsize::new(0));
        let subscribed = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let close_signal = Arc::new(Notify::new());

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (pubsub_tx, pubsub_rx) = mpsc::unbounded_channel();

        tokio::spawn(writer_task(write_half, write_rx, in_flight.clone(), closed.clone(), close_signal.clone()));
        tokio::spawn(reader_task(
            read_half,
            in_flight,
            subscribed.clone(),
            closed.clone(),
            close_signal.clone(),
            pubsub_tx,
        ));

        Ok(Connection {
            write_tx,
            in_flight_count,
            subscribed,
            closed,
            close_signal,
            pubsub_rx: Mutex::new(Some(pubsub_rx)),
        })
    }

    /// Sends a command and awaits its reply.
    ///
    /// Dropping the returned future before it resolves does not cancel the
    /// request on the wire: the slot stays queued in the FIFO and the
    /// reply, once it arrives, is simply discarded. This is load-bearing --
    /// without it a cancelled caller would desynchronize the FIFO for
    /// every request behind it.
    pub async fn execute(&self, cmd: &str, args: &[Arg]) -> RespResult<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RespError::ConnectionClosed);
        }
        if self.subscribed.load(Ordering::Acquire) {
            return Err(RespError::Protocol(
                "connection is in pub/sub mode and cannot run commands".into(),
            ));
        }

        let bytes = encode_command(cmd, args);
        let (tx, rx) = oneshot::channel();

        self.in_flight_count.fetch_add(1, Ordering::AcqRel);
        let _guard = InFlightGuard(&self.in_flight_count);

        self.write_tx
            .send(WriteJob::Request { bytes, completion: tx })
            .map_err(|_| RespError::ConnectionClosed)?;

        rx.await.unwrap_or(Err(RespError::ConnectionClosed))
    }

    /// Issues `SUBSCRIBE` for the given channels and puts the connection
    /// into pub/sub mode. After this call `execute` fails on this
    /// connection; incoming messages are available through the paired
    /// pub/sub receiver (see `take_pubsub_receiver`, used by
    /// `PubSubHandle`).
    pub async fn subscribe(&self, channels: &[Arg]) -> RespResult<()> {
        self.subscribed.store(true, Ordering::Release);
        let bytes = encode_command("SUBSCRIBE", channels);
        self.write_tx
            .send(WriteJob::Fire { bytes })
            .map_err(|_| RespError::ConnectionClosed)
    }

    pub async fn psubscribe(&self, patterns: &[Arg]) -> RespResult<()> {
        self.subscribed.store(true, Ordering::Release);
        let bytes = encode_command("PSUBSCRIBE", patterns);
        self.write_tx
            .send(WriteJob::Fire { bytes })
            .map_err(|_| RespError::ConnectionClosed)
    }

    pub async fn unsubscribe(&self, channels: &[Arg]) -> RespResult<()> {
        let bytes = encode_command("UNSUBSCRIBE", channels);
        self.write_tx
            .send(WriteJob::Fire { bytes })
            .map_err(|_| RespError::ConnectionClosed)
    }

    pub async fn punsubscribe(&self, patterns: &[Arg]) -> RespResult<()> {
        let bytes = encode_command("PUNSUBSCRIBE", patterns);
        self.write_tx
            .send(WriteJob::Fire { bytes })
            .map_err(|_| RespError::ConnectionClosed)
    }

    /// Cancels every pending and in-flight request with `ConnectionClosed`
    /// and tears down the socket. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_signal.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    /// Number of requests currently dispatched to this connection and
    /// awaiting a reply. Used by `Pool` for least-loaded dispatch.
    pub fn in_flight(&self) -> usize {
        self.in_flight_count.load(Ordering::Acquire)
    }

    /// Takes ownership of this connection's pub/sub message receiver. Only
    /// meaningful once `subscribe`/`psubscribe` has been called; a pool
    /// calls this exactly once when handing a freshly dedicated connection
    /// to a new `PubSubHandle`.
    pub fn take_pubsub_receiver(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.pubsub_rx.lock().unwrap().take()
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn writer_task(
    mut write_half: OwnedWriteHalf,
    mut write_rx: mpsc::UnboundedReceiver<WriteJob>,
    in_flight: Arc<Mutex<VecDeque<CompletionSlot>>>,
    closed: Arc<AtomicBool>,
    close_signal: Arc<Notify>,
) {
    loop {
        if closed.load(Ordering::Acquire) {
            let _ = write_half.shutdown().await;
            return;
        }
        tokio::select! {
            biased;
            _ = close_signal.notified() => {
                let _ = write_half.shutdown().await;
                return;
            }
            job = write_rx.recv() => {
                match job {
                    None => {
                        let _ = write_half.shutdown().await;
                        return;
                    }
                    Some(WriteJob::Request { bytes, completion }) => {
                        if let Err(e) = write_half.write_all(&bytes).await {
                            tracing::warn!(error = %e, "write failed, tearing down connection");
                            let _ = completion.send(Err(RespError::ConnectionClosed));
                            teardown(&in_flight, &closed, &RespError::Io(e));
                            return;
                        }
                        in_flight.lock().unwrap().push_back(completion);
                    }
                    Some(WriteJob::Fire { bytes }) => {
                        if let Err(e) = write_half.write_all(&bytes).await {
                            tracing::warn!(error = %e, "write failed, tearing down connection");
                            teardown(&in_flight, &closed, &RespError::Io(e));
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn reader_task(
    mut read_half: OwnedReadHalf,
    in_flight: Arc<Mutex<VecDeque<CompletionSlot>>>,
    subscribed: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    close_signal: Arc<Notify>,
    pubsub_tx: mpsc::UnboundedSender<Message>,
) {
    let mut decoder = Decoder::new();
    let mut buf = [0u8; READ_BUF_SIZE];

    loop {
        if closed.load(Ordering::Acquire) {
            teardown(&in_flight, &closed, &RespError::ConnectionClosed);
            return;
        }
        tokio::select! {
            biased;
            _ = close_signal.notified() => {
                teardown(&in_flight, &closed, &RespError::ConnectionClosed);
                return;
            }
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        teardown(&in_flight, &closed, &RespError::ConnectionClosed);
                        return;
                    }
                    Ok(n) => {
                        decoder.feed(&buf[..n]);
                        if let Err(stop) = drain_ready_replies(&mut decoder, &in_flight, &subscribed, &pubsub_tx) {
                            teardown(&in_flight, &closed, &stop);
                            return;
                        }
                    }
                    Err(e) => {
                        teardown(&in_flight, &closed, &RespError::Io(e));
                        return;
                    }
                }
            }
        }
    }
}

/// Pulls every value the decoder currently has ready and routes each one
/// either to the pub/sub dispatcher or to the next queued completion slot.
/// A per-request `RespError::Redis` is delivered to that request's slot
/// without stopping the loop; any other error is fatal and returned to the
/// caller, which tears the connection down.
fn drain_ready_replies(
    decoder: &mut Decoder,
    in_flight: &Arc<Mutex<VecDeque<CompletionSlot>>>,
    subscribed: &Arc<AtomicBool>,
    pubsub_tx: &mpsc::UnboundedSender<Message>,
) -> Result<(), RespError> {
    loop {
        match decoder.gets() {
            Ok(None) => return Ok(()),
            Ok(Some(value)) => {
                if subscribed.load(Ordering::Acquire) {
                    if let Some(message) = Message::from_push(&value) {
                        let _ = pubsub_tx.send(message);
                    }
                } else {
                    complete_next(in_flight, Ok(value));
                }
            }
            Err(RespError::Redis(text)) => {
                complete_next(in_flight, Err(RespError::Redis(text)));
            }
            Err(other) => return Err(other),
        }
    }
}

fn complete_next(in_flight: &Arc<Mutex<VecDeque<CompletionSlot>>>, result: RespResult<Value>) {
    let slot = in_flight.lock().unwrap().pop_front();
    match slot {
        Some(slot) => {
            let _ = slot.send(result);
        }
        None => {
            tracing::warn!("received a reply with no matching in-flight request");
        }
    }
}

fn teardown(in_flight: &Arc<Mutex<VecDeque<CompletionSlot>>>, closed: &AtomicBool, cause: &RespError) {
    closed.store(true, Ordering::Release);
    tracing::debug!(error = %cause, "connection tearing down");
    let mut queue = in_flight.lock().unwrap();
    while let Some(slot) = queue.pop_front() {
        let _ = slot.send(Err(RespError::ConnectionClosed));
    }
}
