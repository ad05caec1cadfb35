//! End-to-end tests against an in-process mock RESP server.
//!
//! The unit tests colocated with `decoder`, `encoder`, `connection`, and
//! `pool` exercise each piece in isolation. These drive the full stack
//! over a real TCP loopback socket -- `Pool`/`Connection` on one end, a
//! small hand-rolled RESP server on the other -- matching the pipelined
//! pool and pub/sub scenarios end to end instead of module by module.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::StreamExt;

use crate::connection::Connection;
use crate::decoder::{Decoder, Value};
use crate::encoder::Arg;
use crate::error::RespError;
use crate::pool::Pool;

/// Binds an ephemeral mock server and spawns `handler` once per accepted
/// connection. Returns the address to connect to.
async fn spawn_server<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let handler = handler.clone();
            tokio::spawn(async move { handler(stream).await });
        }
    });
    addr
}

/// Reads bytes off `stream` into `decoder` until a full top-level command
/// array is available, returning its bulk-string elements as raw bytes.
/// Returns `None` once the socket is gone or the stream stops looking like
/// well-formed client traffic.
async fn read_command(stream: &mut TcpStream, decoder: &mut Decoder) -> Option<Vec<Vec<u8>>> {
    loop {
        match decoder.gets() {
            Ok(Some(Value::Array(Some(items)))) => {
                return Some(
                    items
                        .into_iter()
                        .map(|v| match v {
                            Value::Bulk(Some(b)) => b.to_vec(),
                            _ => Vec::new(),
                        })
                        .collect(),
                );
            }
            Ok(Some(_)) | Err(_) => return None,
            Ok(None) => {}
        }
        let mut buf = [0u8; 4096];
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => decoder.feed(&buf[..n]),
        }
    }
}

fn encode_simple(text: &str) -> Vec<u8> {
    format!("+{text}\r\n").into_bytes()
}

fn encode_error(text: &str) -> Vec<u8> {
    format!("-{text}\r\n").into_bytes()
}

fn encode_bulk_reply(payload: &[u8]) -> Vec<u8> {
    let mut buf = format!("${}\r\n", payload.len()).into_bytes();
    buf.extend_from_slice(payload);
    buf.extend_from_slice(b"\r\n");
    buf
}

const NULL_BULK: &[u8] = b"$-1\r\n";

fn encode_pubsub_confirm(kind: &str, channel: &str, count: i64) -> Vec<u8> {
    format!(
        "*3\r\n${}\r\n{}\r\n${}\r\n{}\r\n:{}\r\n",
        kind.len(),
        kind,
        channel.len(),
        channel,
        count
    )
    .into_bytes()
}

fn encode_pubsub_message(channel: &str, payload: &[u8]) -> Vec<u8> {
    let mut buf = format!("*3\r\n$7\r\nmessage\r\n${}\r\n{}\r\n${}\r\n", channel.len(), channel, payload.len())
        .into_bytes();
    buf.extend_from_slice(payload);
    buf.extend_from_slice(b"\r\n");
    buf
}

#[tokio::test]
async fn pipelined_requests_complete_in_fifo_order() {
    let addr = spawn_server(|mut stream| async move {
        let mut decoder = Decoder::new();
        while let Some(cmd) = read_command(&mut stream, &mut decoder).await {
            if cmd.first().map(Vec::as_slice) == Some(b"ECHO".as_slice()) {
                let reply = encode_bulk_reply(&cmd[1]);
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
            }
        }
    })
    .await;

    let conn = Connection::open(addr).await.unwrap();
    let mut futures = Vec::new();
    for i in 0..200 {
        futures.push(conn.execute("ECHO", &[Arg::from(i.to_string())]));
    }
    let results = futures::future::join_all(futures).await;
    for (i, result) in results.into_iter().enumerate() {
        match result.unwrap() {
            Value::Bulk(Some(b)) => assert_eq!(&b[..], i.to_string().as_bytes()),
            other => panic!("unexpected reply for request {i}: {other:?}"),
        }
    }
}

#[tokio::test]
async fn pool_set_then_get_round_trip() {
    let store: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));
    let store_for_server = store.clone();
    let addr = spawn_server(move |mut stream| {
        let store = store_for_server.clone();
        async move {
            let mut decoder = Decoder::new();
            while let Some(cmd) = read_command(&mut stream, &mut decoder).await {
                let reply = match cmd.first().map(Vec::as_slice) {
                    Some(b"SET") => {
                        store.lock().unwrap().insert(cmd[1].clone(), cmd[2].clone());
                        encode_simple("OK")
                    }
                    Some(b"GET") => match store.lock().unwrap().get(&cmd[1]) {
                        Some(v) => encode_bulk_reply(v),
                        None => NULL_BULK.to_vec(),
                    },
                    _ => encode_error("ERR unknown command"),
                };
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
            }
        }
    })
    .await;

    let pool = Pool::create(&format!("redis://{addr}"), 2, 0).await.unwrap();
    pool.set("hello", "world").await.unwrap();
    let value = pool.get("hello").await.unwrap();
    assert_eq!(value, Value::Bulk(Some(Bytes::from_static(b"world"))));

    let missing = pool.get("nope").await.unwrap();
    assert_eq!(missing, Value::Bulk(None));
}

#[tokio::test]
async fn redis_error_reply_is_local_to_the_request() {
    let addr = spawn_server(|mut stream| async move {
        let mut decoder = Decoder::new();
        let mut seen = 0u32;
        while let Some(_cmd) = read_command(&mut stream, &mut decoder).await {
            seen += 1;
            let reply = if seen == 1 { encode_error("ERR bad command") } else { encode_simple("PONG") };
            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    })
    .await;

    let conn = Connection::open(addr).await.unwrap();

    let first = conn.execute("BADCMD", &[]).await;
    assert!(matches!(first, Err(RespError::Redis(_))));

    // the connection must still be healthy after a per-request error
    let second = conn.execute("PING", &[]).await.unwrap();
    assert_eq!(second, Value::SimpleString("PONG".into()));
}

#[tokio::test]
async fn close_cancels_pending_requests_with_connection_closed() {
    let addr = spawn_server(|mut stream| async move {
        // accepts bytes but never replies, so the request never completes
        // on its own
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    })
    .await;

    let conn = Arc::new(Connection::open(addr).await.unwrap());
    let pending = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.execute("PING", &[]).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.close();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(RespError::ConnectionClosed)));

    let after_close = conn.execute("PING", &[]).await;
    assert!(matches!(after_close, Err(RespError::ConnectionClosed)));
}

#[tokio::test]
async fn pool_handles_many_concurrent_pipelined_requests() {
    let store: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));
    let store_for_server = store.clone();
    let addr = spawn_server(move |mut stream| {
        let store = store_for_server.clone();
        async move {
            let mut decoder = Decoder::new();
            while let Some(cmd) = read_command(&mut stream, &mut decoder).await {
                let reply = match cmd.first().map(Vec::as_slice) {
                    Some(b"SET") => {
                        store.lock().unwrap().insert(cmd[1].clone(), cmd[2].clone());
                        encode_simple("OK")
                    }
                    Some(b"GET") => match store.lock().unwrap().get(&cmd[1]) {
                        Some(v) => encode_bulk_reply(v),
                        None => NULL_BULK.to_vec(),
                    },
                    _ => encode_error("ERR unknown command"),
                };
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
            }
        }
    })
    .await;

    let pool = Pool::create(&format!("redis://{addr}"), 2, 0).await.unwrap();
    let mut futures = Vec::new();
    for i in 0..2000 {
        futures.push(pool.set(format!("bench{i}"), "yes"));
    }
    let results = futures::future::join_all(futures).await;
    assert!(results.iter().all(Result::is_ok));

    let value = pool.get("bench0").await.unwrap();
    assert_eq!(value, Value::Bulk(Some(Bytes::from_static(b"yes"))));
}

#[tokio::test]
async fn pubsub_handle_receives_published_messages() {
    let addr = spawn_server(|mut stream| async move {
        let mut decoder = Decoder::new();
        if let Some(cmd) = read_command(&mut stream, &mut decoder).await {
            assert_eq!(cmd[0], b"SUBSCRIBE");
            let channel = String::from_utf8(cmd[1].clone()).unwrap();
            if stream.write_all(&encode_pubsub_confirm("subscribe", &channel, 1)).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = stream.write_all(&encode_pubsub_message(&channel, b"hello world")).await;
        }
        // keep the socket open until the test end drops its side
        let mut buf = [0u8; 64];
        let _ = stream.read(&mut buf).await;
    })
    .await;

    let pool = Pool::create(&format!("redis://{addr}"), 1, 0).await.unwrap();
    let mut handle = pool.pubsub().await.unwrap();
    handle.subscribe("news").await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(1), handle.next())
        .await
        .expect("timed out waiting for a pub/sub message")
        .expect("stream ended without delivering a message");
    assert_eq!(message.channel, "news");
    assert_eq!(&message.payload[..], b"hello world");
}

#[tokio::test]
async fn pool_exhausted_once_every_connection_has_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for _ in 0..2 {
            if let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        }
    });

    let pool = Pool::create(&format!("redis://{addr}"), 2, 0).await.unwrap();
    // give both reader tasks a moment to observe the server hanging up
    tokio::time::sleep(Duration::from_millis(200)).await;

    let result = pool.execute("PING", &[]).await;
    assert!(matches!(result, Err(RespError::PoolExhausted) | Err(RespError::ConnectionClosed)));
}
