//! Incremental RESP2 decoder.
//!
//! `Decoder` is fed raw bytes as they arrive off the wire and pulls complete
//! values back out one at a time. It never blocks and never assumes a whole
//! frame is present in a single `feed`: a reply can straddle an arbitrary
//! number of reads, and the decoder must pick up exactly where it left off
//! on the next call. This is the same shape as `Connection::parse_frame` in
//! a framed TCP client — check first, then parse, rewind on short input —
//! generalized from a fixed 16-byte PDU header to RESP2's five lead bytes
//! and arbitrarily nested arrays.
//!
//! Nesting is handled with an explicit stack rather than recursion, so a
//! reply nested arbitrarily deep never grows the call stack and a partial
//! array (e.g. `*3\r\n` followed by only one child so far) can sit parsed
//! halfway across any number of `feed` calls.

use bytes::{Bytes, BytesMut};

use crate::error::{RespError, RespResult};

/// Redis replies are multiplexed through RESP down to five wire shapes.
/// `Array(None)` is the RESP null array (`*-1\r\n`); `Bulk(None)` is the
/// RESP null bulk string (`$-1\r\n`). `Error` is produced by the parser for
/// every `-` frame, nested or not — only `Decoder::gets` promotes a
/// *top-level* `Error` into a failure; one nested inside an array (as Redis
/// sends for `MULTI`/`EXEC` failures) is returned as ordinary data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    SimpleString(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<Value>>),
}

/// Default ceiling on a single bulk string's declared length (512 MiB,
/// matching Redis's own `proto-max-bulk-len` default). Guards against a
/// corrupt or hostile length prefix asking us to buffer gigabytes before
/// discovering the frame is garbage.
pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Default ceiling on the element count of a single array frame.
pub const DEFAULT_MAX_ARRAY_LEN: usize = 1024 * 1024;

/// State of the single frame currently being assembled at the cursor.
/// Everything that sits deeper (completed array elements waiting on their
/// siblings) lives on `stack`, not here — only one frame is ever "in
/// progress" for want of more bytes at a time.
#[derive(Debug, Clone, Copy)]
enum FrameState {
    /// Nothing read yet; `cursor` points at the next lead byte.
    Lead,
    /// Lead byte consumed, scanning for the line's terminating CRLF.
    /// `line_scan_from` remembers how far we've already confirmed there is
    /// no CRLF, so a line that trickles in one byte at a time is never
    /// rescanned from its start — this is what keeps `gets` amortized O(1)
    /// per byte instead of O(n^2) over a slow feed.
    Line { lead: u8, line_scan_from: usize },
    /// Bulk string length parsed; waiting for `len` body bytes plus the
    /// trailing CRLF to all be present starting at `body_start`.
    BulkBody { len: usize, body_start: usize },
}

struct PendingArray {
    remaining: usize,
    children: Vec<Value>,
}

/// A pull-style, resumable RESP2 decoder over an internal byte buffer.
pub struct Decoder {
    buffer: BytesMut,
    cursor: usize,
    state: FrameState,
    stack: Vec<PendingArray>,
    max_bulk_len: usize,
    max_array_len: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_BULK_LEN, DEFAULT_MAX_ARRAY_LEN)
    }

    pub fn with_limits(max_bulk_len: usize, max_array_len: usize) -> Self {
        Decoder {
            buffer: BytesMut::with_capacity(4 * 1024),
            cursor: 0,
            state: FrameState::Lead,
            stack: Vec::new(),
            max_bulk_len,
            max_array_len,
        }
    }

    /// Appends freshly read bytes to the internal buffer. Never parses;
    /// call `gets` afterwards to pull out whatever that made ready.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes held that have not yet been folded into a completed
    /// value (this can be nonzero even mid-array, once some children have
    /// already been consumed past the cursor).
    pub fn len(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-only view of the unconsumed tail of the buffer.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer[self.cursor..]
    }

    /// Pulls the next complete top-level reply out of the buffer, if one is
    /// ready.
    ///
    /// Returns `Ok(None)` ("NotReady") when the buffer doesn't yet hold a
    /// full reply — this is a sentinel distinct from any real value,
    /// including the RESP null bulk/array, so callers never confuse "wait
    /// for more bytes" with "the server sent nil". Returns `Err` for a
    /// malformed frame (fatal to the connection) or for a top-level `-`
    /// reply, which `gets` itself promotes into `RespError::Redis` rather
    /// than handing back `Value::Error` — nested errors inside an array
    /// are left alone and returned as ordinary `Value::Array` contents.
    pub fn gets(&mut self) -> RespResult<Option<Value>> {
        loop {
            match self.state {
                FrameState::Lead => {
                    if self.cursor >= self.buffer.len() {
                        return Ok(None);
                    }
                    let lead = self.buffer[self.cursor];
                    self.state = FrameState::Line {
                        lead,
                        line_scan_from: self.cursor + 1,
                    };
                }
                FrameState::Line { lead, line_scan_from } => {
                    match self.find_crlf(line_scan_from) {
                        None => {
                            let new_from = self.buffer.len().saturating_sub(1).max(line_scan_from);
                            self.state = FrameState::Line {
                                lead,
                                line_scan_from: new_from,
                            };
                            return Ok(None);
                        }
                        Some(crlf_pos) => {
                            let line_start = self.cursor + 1;
                            let line_end = crlf_pos + 2;
                            let outcome = {
                                let line = &self.buffer[line_start..crlf_pos];
                                self.classify_line(lead, line)?
                            };
                            match outcome {
                                LineOutcome::Value(value) => {
                                    self.cursor = line_end;
                                    self.state = FrameState::Lead;
                                    if let Some(top) = self.fold(value)? {
                                        return self.emit(top);
                                    }
                                }
                                LineOutcome::BulkHeader { len } => {
                                    self.state = FrameState::BulkBody { len, body_start: line_end };
                                }
                                LineOutcome::ArrayHeader { remaining } => {
                                    self.cursor = line_end;
                                    self.state = FrameState::Lead;
                                    self.stack.push(PendingArray {
                                        remaining,
                                        children: Vec::with_capacity(remaining.min(1024)),
                                    });
                                }
                            }
                        }
                    }
                }
                FrameState::BulkBody { len, body_start } => {
                    let needed_end = body_start + len + 2;
                    if self.buffer.len() < needed_end {
                        return Ok(None);
                    }
                    if &self.buffer[body_start + len..needed_end] != b"\r\n" {
                        return Err(RespError::Protocol(
                            "bulk string body missing trailing CRLF".into(),
                        ));
                    }
                    let body = Bytes::copy_from_slice(&self.buffer[body_start..body_start + len]);
                    self.cursor = needed_end;
                    self.state = FrameState::Lead;
                    if let Some(top) = self.fold(Value::Bulk(Some(body)))? {
                        return self.emit(top);
                    }
                }
            }
        }
    }

    /// Finds the next CRLF in `self.buffer` starting no earlier than
    /// `from`. Returns the absolute index of the `\r`.
    fn find_crlf(&self, from: usize) -> Option<usize> {
        let from = from.min(self.buffer.len());
        self.buffer[from..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|i| from + i)
    }

    fn classify_line(&self, lead: u8, line: &[u8]) -> RespResult<LineOutcome> {
        match lead {
            b'+' => Ok(LineOutcome::Value(Value::SimpleString(utf8_field(line, "simple string")?))),
            b'-' => Ok(LineOutcome::Value(Value::Error(utf8_field(line, "error message")?))),
            b':' => Ok(LineOutcome::Value(Value::Integer(parse_i64_field(line)?))),
            b'$' => {
                let len = parse_i64_field(line)?;
                match len {
                    -1 => Ok(LineOutcome::Value(Value::Bulk(None))),
                    n if n >= 0 => {
                        let n = n as usize;
                        if n > self.max_bulk_len {
                            return Err(RespError::Protocol(format!(
                                "bulk length {n} exceeds configured maximum {}",
                                self.max_bulk_len
                            )));
                        }
                        Ok(LineOutcome::BulkHeader { len: n })
                    }
                    _ => Err(RespError::Protocol(format!("invalid bulk length {len}"))),
                }
            }
            b'*' => {
                let len = parse_i64_field(line)?;
                match len {
                    -1 => Ok(LineOutcome::Value(Value::Array(None))),
                    0 => Ok(LineOutcome::Value(Value::Array(Some(Vec::new())))),
                    n if n > 0 => {
                        let n = n as usize;
                        if n > self.max_array_len {
                            return Err(RespError::Protocol(format!(
                                "array length {n} exceeds configured maximum {}",
                                self.max_array_len
                            )));
                        }
                        Ok(LineOutcome::ArrayHeader { remaining: n })
                    }
                    _ => Err(RespError::Protocol(format!("invalid array length {len}"))),
                }
            }
            other => Err(RespError::Protocol(format!(
                "unrecognized RESP lead byte {:#04x}",
                other
            ))),
        }
    }

    /// Folds a just-parsed value into the top of the pending-array stack,
    /// popping completed arrays upward as far as they go. Returns
    /// `Ok(Some(value))` only once the stack has fully unwound, i.e. this
    /// value — possibly itself an array built up over many `gets` calls —
    /// is the complete top-level reply.
    fn fold(&mut self, mut value: Value) -> RespResult<Option<Value>> {
        loop {
            match self.stack.last_mut() {
                None => return Ok(Some(value)),
                Some(frame) => {
                    frame.children.push(value);
                    if frame.children.len() == frame.remaining {
                        let frame = self.stack.pop().expect("just matched Some");
                        value = Value::Array(Some(frame.children));
                    } else {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Discards consumed bytes and turns a completed top-level value into
    /// the `gets` return value, promoting a bare error reply to a failure.
    fn emit(&mut self, top: Value) -> RespResult<Option<Value>> {
        if self.cursor > 0 {
            bytes::Buf::advance(&mut self.buffer, self.cursor);
            self.cursor = 0;
        }
        match top {
            Value::Error(text) => Err(RespError::Redis(text)),
            other => Ok(Some(other)),
        }
    }
}

enum LineOutcome {
    Value(Value),
    BulkHeader { len: usize },
    ArrayHeader { remaining: usize },
}

fn utf8_field(bytes: &[u8], what: &str) -> RespResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| RespError::Protocol(format!("{what} is not valid UTF-8")))
}

fn parse_i64_field(bytes: &[u8]) -> RespResult<i64> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| RespError::Protocol("non-UTF-8 numeric field".into()))?;
    text.parse::<i64>()
        .map_err(|_| RespError::Protocol(format!("field '{text}' is not a valid 64-bit integer")))
}
