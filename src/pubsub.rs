//! Scoped pub/sub subscriptions.
//!
//! A `PubSubHandle` owns a connection dedicated entirely to pub/sub once
//! issued: `Pool::pubsub` promotes or reuses one connection out of band
//! from the pipelining pool, and nothing else is ever dispatched to it.
//! Incoming `message`/`pmessage` pushes are exposed as a `Stream` of
//! `Message`; subscribe/unsubscribe confirmations are consumed internally
//! and not surfaced, since callers subscribe by awaiting the call itself
//! rather than by watching for a confirmation on the stream.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;

use crate::connection::Connection;
use crate::decoder::Value;
use crate::encoder::Arg;
use crate::error::RespResult;

/// A message pushed by the server for a channel this handle is subscribed
/// to, whether directly (`message`) or through a pattern (`pmessage`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub payload: Bytes,
}

impl Message {
    /// Interprets a decoded `Value` as a pub/sub push, if it is one.
    /// Subscribe/unsubscribe/psubscribe/punsubscribe confirmations are
    /// recognized but deliberately not turned into a `Message` -- they
    /// carry a channel and a count, not a payload, and the handle's
    /// `subscribe`/`unsubscribe` calls already tell the caller what they
    /// need to know.
    pub(crate) fn from_push(value: &Value) -> Option<Message> {
        let items = match value {
            Value::Array(Some(items)) => items,
            _ => return None,
        };
        let kind = match items.first() {
            Some(Value::Bulk(Some(b))) => b.as_ref(),
            _ => return None,
        };
        match kind {
            b"message" if items.len() >= 3 => Some(Message {
                channel: bulk_string(&items[1])?,
                payload: bulk_bytes(&items[2])?,
            }),
            b"pmessage" if items.len() >= 4 => Some(Message {
                channel: bulk_string(&items[2])?,
                payload: bulk_bytes(&items[3])?,
            }),
            _ => None,
        }
    }
}

fn bulk_string(value: &Value) -> Option<String> {
    match value {
        Value::Bulk(Some(b)) => String::from_utf8(b.to_vec()).ok(),
        _ => None,
    }
}

fn bulk_bytes(value: &Value) -> Option<Bytes> {
    match value {
        Value::Bulk(Some(b)) => Some(b.clone()),
        _ => None,
    }
}

/// A scoped subscription over a dedicated connection.
///
/// Dropping the handle closes the underlying connection. `Connection` has
/// no operation that turns `Subscribed` mode back off once any SUBSCRIBE
/// has been issued (and no way to hand back a fresh pub/sub receiver
/// channel once this handle's has been taken), so closing is what actually
/// returns the dedicated connection to a reusable state: `Pool::pubsub`
/// checks `is_closed()` and opens a brand new connection the next time
/// it's called, rather than reusing a socket this handle already drained.
pub struct PubSubHandle {
    connection: Arc<Connection>,
    receiver: Option<UnboundedReceiverStream<Message>>,
}

impl PubSubHandle {
    pub(crate) fn new(connection: Arc<Connection>, receiver: mpsc::UnboundedReceiver<Message>) -> Self {
        PubSubHandle {
            connection,
            receiver: Some(UnboundedReceiverStream::new(receiver)),
        }
    }

    pub async fn subscribe(&self, channel: impl Into<Arg>) -> RespResult<()> {
        self.connection.subscribe(&[channel.into()]).await
    }

    pub async fn psubscribe(&self, pattern: impl Into<Arg>) -> RespResult<()> {
        self.connection.psubscribe(&[pattern.into()]).await
    }

    pub async fn unsubscribe(&self, channel: impl Into<Arg>) -> RespResult<()> {
        self.connection.unsubscribe(&[channel.into()]).await
    }

    pub async fn punsubscribe(&self, pattern: impl Into<Arg>) -> RespResult<()> {
        self.connection.punsubscribe(&[pattern.into()]).await
    }
}

impl Stream for PubSubHandle {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.receiver.as_mut() {
            Some(stream) => Pin::new(stream).poll_next(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for PubSubHandle {
    fn drop(&mut self) {
        // Tearing down the socket is what unsubscribes from everything at
        // once on the server side, and is the only way to make the
        // connection eligible for `Pool::pubsub` to reopen fresh: the
        // connection's `subscribed` flag is one-way once set, so leaving
        // the socket open here would leave it permanently unusable.
        self.connection.close();
    }
}
