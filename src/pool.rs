//! A fixed-size pool of pipelined connections plus a lazily-established
//! dedicated pub/sub connection.
//!
//! Every connection in the pool pipelines independently; `Pool::execute`
//! just has to pick which one gets a given request. Dispatch favors
//! whichever live, non-subscribed connection currently has the fewest
//! requests in flight, breaking ties by rotating the scan's starting
//! point on every call rather than always starting from slot 0 -- this is
//! the same "least connections, round-robin tiebreak" policy a reverse
//! proxy uses in front of a backend pool, generalized here to pipelined
//! RESP connections instead of whole backend servers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::connection::Connection;
use crate::decoder::Value;
use crate::encoder::Arg;
use crate::error::{RespError, RespResult};
use crate::pubsub::PubSubHandle;

/// `redis://host:port` (and bare `host:port`) are accepted; anything else
/// is a protocol error rather than a guess.
fn parse_address(url: &str) -> RespResult<String> {
    match url.strip_prefix("redis://") {
        Some(rest) => Ok(rest.to_string()),
        None if url.contains("://") => Err(RespError::Protocol(format!(
            "unsupported connection URL scheme in '{url}'"
        ))),
        None => Ok(url.to_string()),
    }
}

pub struct Pool {
    address: String,
    connections: Vec<Option<Arc<Connection>>>,
    cursor: AtomicUsize,
    pubsub_conn: AsyncMutex<Option<Arc<Connection>>>,
}

impl Pool {
    /// Opens `pool_size` connections concurrently against `url`. At least
    /// one must succeed or the pool itself fails to come up; slots that
    /// individually failed to connect are recorded as dead and simply
    /// excluded from dispatch (`reconnect_policy` governs whether a
    /// background task is later spun up to retry them -- see
    /// `Pool::reconnect_policy`'s module docs in `SPEC_FULL.md` §4.3 for
    /// the zero-disables-retry default this crate implements).
    pub async fn create(url: &str, pool_size: usize, reconnect_policy: u32) -> RespResult<Pool> {
        let address = parse_address(url)?;
        if pool_size == 0 {
            return Err(RespError::Protocol("pool_size must be at least 1".into()));
        }

        let attempts = futures::future::join_all(
            std::iter::repeat_with(|| Connection::open(address.clone())).take(pool_size),
        )
        .await;

        let mut connections = Vec::with_capacity(pool_size);
        let mut live = 0usize;
        for attempt in attempts {
            match attempt {
                Ok(conn) => {
                    live += 1;
                    connections.push(Some(Arc::new(conn)));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pool connection slot failed to establish");
                    connections.push(None);
                }
            }
        }
        if live == 0 {
            return Err(RespError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "create_pool: every connection attempt failed",
            )));
        }

        let pubsub_conn = if reconnect_policy != 0 {
            AsyncMutex::new(Some(Arc::new(Connection::open(address.clone()).await?)))
        } else {
            AsyncMutex::new(None)
        };

        Ok(Pool {
            address,
            connections,
            cursor: AtomicUsize::new(0),
            pubsub_conn,
        })
    }

    /// The configured pool size, not the number of currently live
    /// connections -- a slot that failed to connect (or later closed) is
    /// still counted, matching the synchronous attribute the original
    /// client exposes.
    pub fn pool_size(&self) -> usize {
        self.connections.len()
    }

    pub async fn execute(&self, cmd: &str, args: &[Arg]) -> RespResult<Value> {
        self.pick_connection()?.execute(cmd, args).await
    }

    /// Thin adapter over `execute`; Redis's `SET` reply is `+OK`, which
    /// this crate surfaces as success rather than as a `Value` callers
    /// have to pattern-match on.
    pub async fn set(&self, key: impl Into<Arg>, value: impl Into<Arg>) -> RespResult<()> {
        self.execute("SET", &[key.into(), value.into()]).await?;
        Ok(())
    }

    pub async fn get(&self, key: impl Into<Arg>) -> RespResult<Value> {
        self.execute("GET", &[key.into()]).await
    }

    /// Hands back a scoped pub/sub handle over the pool's dedicated
    /// connection, establishing it on first use if `reconnect_policy` was
    /// zero at `create` time.
    pub async fn pubsub(&self) -> RespResult<PubSubHandle> {
        let mut guard = self.pubsub_conn.lock().await;
        let needs_new = match guard.as_ref() {
            Some(conn) => conn.is_closed(),
            None => true,
        };
        if needs_new {
            *guard = Some(Arc::new(Connection::open(self.address.clone()).await?));
        }
        let conn = guard.as_ref().expect("just ensured Some").clone();
        drop(guard);

        // A fresh pub/sub receiver is only available immediately after the
        // connection above was just opened; `PubSubHandle::drop` closes its
        // connection rather than leaving it open for reuse (`Connection`
        // has no way to leave `Subscribed` mode once entered), so `guard`
        // never holds a closed-but-still-present connection with its
        // receiver already taken. This only fails if the dedicated
        // connection is somehow already serving another live
        // `PubSubHandle` -- pub/sub connections are single-tenant by
        // construction.
        let receiver = conn
            .take_pubsub_receiver()
            .ok_or_else(|| RespError::Protocol("pub/sub connection already has an active handle".into()))?;
        Ok(PubSubHandle::new(conn, receiver))
    }

    fn pick_connection(&self) -> RespResult<Arc<Connection>> {
        let n = self.connections.len();
        if n == 0 {
            return Err(RespError::PoolExhausted);
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        let mut best: Option<(usize, &Arc<Connection>)> = None;
        for offset in 0..n {
            let idx = (start + offset) % n;
            if let Some(conn) = &self.connections[idx] {
                if conn.is_closed() || conn.is_subscribed() {
                    continue;
                }
                let load = conn.in_flight();
                match best {
                    Some((best_load, _)) if load >= best_load => {}
                    _ => best = Some((load, conn)),
                }
            }
        }
        best.map(|(_, conn)| conn.clone()).ok_or(RespError::PoolExhausted)
    }
}

/// `create_pool("redis://host:port", pool_size, reconnect_policy)`, the
/// crate's top-level entry point.
pub async fn create_pool(url: &str, pool_size: usize, reconnect_policy: u32) -> RespResult<Pool> {
    Pool::create(url, pool_size, reconnect_policy).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_redis_url() {
        assert_eq!(parse_address("redis://localhost:6379").unwrap(), "localhost:6379");
    }

    #[test]
    fn accepts_bare_host_port() {
        assert_eq!(parse_address("localhost:6379").unwrap(), "localhost:6379");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(parse_address("rediss://localhost:6379").is_err());
    }
}
