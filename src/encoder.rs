//! Encodes outgoing commands as RESP arrays of bulk strings, the only
//! shape Redis accepts requests in regardless of which reply type comes
//! back.

use bytes::{Bytes, BytesMut};

/// A single command argument. Built from the types callers naturally have
/// lying around (`&str`, `String`, `i64`, `bool`, raw bytes) via `From`
/// rather than a generic trait bound, since a command's arguments are
/// usually a mix of types in one call (`SET key value EX 60`).
#[derive(Debug, Clone)]
pub struct Arg(Bytes);

impl Arg {
    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg(Bytes::from(s.into_bytes()))
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Arg(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<i64> for Arg {
    fn from(n: i64) -> Self {
        Arg(Bytes::from(n.to_string().into_bytes()))
    }
}

/// Encoded as the bare ASCII words `true`/`false`, per spec §6. This
/// diverges from the original client, where `set("hello", True)` followed
/// by `get("hello")` yields `b"1"` -- Redis itself has no boolean type, so
/// this crate encodes the word literally rather than coercing to `1`/`0`.
impl From<bool> for Arg {
    fn from(b: bool) -> Self {
        Arg(Bytes::from_static(if b { b"true" } else { b"false" }))
    }
}

impl From<&[u8]> for Arg {
    fn from(b: &[u8]) -> Self {
        Arg(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for Arg {
    fn from(b: Vec<u8>) -> Self {
        Arg(Bytes::from(b))
    }
}

impl From<Bytes> for Arg {
    fn from(b: Bytes) -> Self {
        Arg(b)
    }
}

/// Serializes `name` and `args` as a RESP array of bulk strings, e.g.
/// `encode_command("SET", &[Arg::from("k"), Arg::from("v")])` produces
/// `*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n`.
pub fn encode_command(name: &str, args: &[Arg]) -> Bytes {
    let mut buf = BytesMut::with_capacity(32 + args.iter().map(|a| a.as_bytes().len() + 16).sum::<usize>());
    buf.extend_from_slice(format!("*{}\r\n", args.len() + 1).as_bytes());
    encode_bulk(&mut buf, name.as_bytes());
    for arg in args {
        encode_bulk(&mut buf, arg.as_bytes());
    }
    buf.freeze()
}

fn encode_bulk(buf: &mut BytesMut, data: &[u8]) {
    buf.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}
