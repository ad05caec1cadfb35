use thiserror::Error;

/// Errors produced while decoding, encoding, or routing RESP traffic.
///
/// Mirrors the failure taxonomy a caller actually needs to branch on: a
/// malformed wire frame is not the same situation as the server replying
/// with `-ERR`, and neither is the same as the socket going away underneath
/// a pending request.
#[derive(Debug, Error)]
pub enum RespError {
    /// The byte stream violates RESP framing (bad length, bad lead byte,
    /// non-UTF-8 where text is required, length exceeding a configured
    /// maximum). Always fatal to the connection that produced it.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server replied with a `-` error frame. Recoverable: the
    /// connection stays open and is returned to the pool for further use.
    #[error("{0}")]
    Redis(String),

    /// The connection the request was issued on (or was waiting on) is no
    /// longer usable. Raised for every in-flight and queued request when a
    /// connection tears down, and for any call made after `close()`.
    #[error("connection closed")]
    ConnectionClosed,

    /// The underlying socket failed outright.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The pool has no connection available to dispatch a request to
    /// (every slot failed to connect, or is closed/subscribed).
    #[error("pool exhausted: no usable connection available")]
    PoolExhausted,
}

pub type RespResult<T> = std::result::Result<T, RespError>;
