use bytes::{Buf, BytesMut};
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Sent to a client once it has been admitted.
pub const GREETING: &[u8] = b"ok\n";

/// Sent to a client that arrives while every admission slot is taken.
pub const REJECTION: &[u8] = b"Connection limit exceeded\n";

/// Status line for a get/delete on an absent key.
pub const NOT_FOUND: &str = "Fcache: key not found";

/// Upper bound on buffered bytes for a single unfinished frame.
const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Get,
    Set,
    Delete,
}

impl Method {
    fn from_token(token: &[u8]) -> Result<Self, ProtocolError> {
        match token {
            b"get" => Ok(Method::Get),
            b"set" => Ok(Method::Set),
            b"delete" => Ok(Method::Delete),
            _ => Err(ProtocolError::UnknownCommand),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "get",
            Method::Set => "set",
            Method::Delete => "delete",
        }
    }

    /// Whether requests with this method change the cache and get journaled.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Method::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub key: String,
    /// Only meaningful for `set`.
    pub value: String,
    /// Relative lifetime in seconds for `set`; 0 = never expires, negative =
    /// already expired.
    pub expire_secs: i64,
}

impl Request {
    pub fn get(key: impl Into<String>) -> Self {
        Request {
            method: Method::Get,
            key: key.into(),
            value: String::new(),
            expire_secs: 0,
        }
    }

    pub fn set(key: impl Into<String>, value: impl Into<String>, expire_secs: i64) -> Self {
        Request {
            method: Method::Set,
            key: key.into(),
            value: value.into(),
            expire_secs,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Request {
            method: Method::Delete,
            key: key.into(),
            value: String::new(),
            expire_secs: 0,
        }
    }

    /// Encode this request as a wire frame.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.key.len() + self.value.len() + 32);
        buf.extend_from_slice(self.method.as_str().as_bytes());
        buf.push(b'\n');
        buf.extend_from_slice(self.key.as_bytes());
        buf.push(b'\n');
        if self.method == Method::Set {
            buf.extend_from_slice(self.value.as_bytes());
            buf.push(b'\n');
            buf.extend_from_slice(self.expire_secs.to_string().as_bytes());
            buf.push(b'\n');
        }
        buf
    }
}

/// A reply written back to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `ok\n`
    Ok,
    /// `ok\n<value>\n`
    Value(String),
    /// `Fcache: key not found\n`
    NotFound,
    /// `<message>\n`, after which the connection is closed.
    Error(String),
}

impl Response {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        buf
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            Response::Ok => buf.extend_from_slice(b"ok\n"),
            Response::Value(v) => {
                buf.extend_from_slice(b"ok\n");
                buf.extend_from_slice(v.as_bytes());
                buf.push(b'\n');
            }
            Response::NotFound => {
                buf.extend_from_slice(NOT_FOUND.as_bytes());
                buf.push(b'\n');
            }
            Response::Error(msg) => {
                buf.extend_from_slice(msg.as_bytes());
                buf.push(b'\n');
            }
        }
    }
}

/// Streaming request parser.
///
/// Call `parse()` repeatedly as data arrives. Returns `Ok(Some(request))` once a
/// complete frame is buffered and consumes it, `Ok(None)` when more data is
/// needed. An unknown method is reported as soon as its line is complete, without
/// waiting for the remaining fields.
pub struct RequestParser;

impl RequestParser {
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
        let method_end = match find_newline_from(buf, 0) {
            Some(pos) => pos,
            None => return Self::need_more(buf),
        };
        let method = Method::from_token(&buf[..method_end])?;

        let field_count = if method == Method::Set { 3 } else { 1 };
        let mut bounds = Vec::with_capacity(field_count);
        let mut start = method_end + 1;
        for _ in 0..field_count {
            match find_newline_from(buf, start) {
                Some(end) => {
                    bounds.push((start, end));
                    start = end + 1;
                }
                None => return Self::need_more(buf),
            }
        }

        let field = |i: usize| -> Result<String, ProtocolError> {
            let (s, e) = bounds[i];
            String::from_utf8(buf[s..e].to_vec()).map_err(|_| ProtocolError::InvalidEncoding)
        };

        let key = field(0)?;
        let request = if method == Method::Set {
            let value = field(1)?;
            let raw = field(2)?;
            let expire_secs: i64 = raw
                .parse()
                .map_err(|_| ProtocolError::InvalidExpire(raw.clone()))?;
            Request::set(key, value, expire_secs)
        } else {
            Request {
                method,
                key,
                value: String::new(),
                expire_secs: 0,
            }
        };

        buf.advance(start);
        Ok(Some(request))
    }

    fn need_more(buf: &BytesMut) -> Result<Option<Request>, ProtocolError> {
        if buf.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge);
        }
        Ok(None)
    }
}

fn find_newline_from(buf: &[u8], start: usize) -> Option<usize> {
    if start >= buf.len() {
        return None;
    }
    buf[start..].iter().position(|&b| b == b'\n').map(|i| start + i)
}

/// Pulls whole requests off an async byte stream.
///
/// `next_request` is cancel-safe: partially received frames stay buffered, so the
/// call can sit inside `tokio::select!` and be restarted.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        FrameReader {
            reader,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// `Ok(None)` means the peer closed the stream on a frame boundary.
    pub async fn next_request(&mut self) -> Result<Option<Request>, ProtocolError> {
        loop {
            if let Some(request) = RequestParser::parse(&mut self.buf)? {
                return Ok(Some(request));
            }
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(ProtocolError::UnexpectedEof)
                };
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown command")]
    UnknownCommand,

    #[error("invalid expire value: {0:?}")]
    InvalidExpire(String),

    #[error("request is not valid UTF-8")]
    InvalidEncoding,

    #[error("request too large")]
    FrameTooLarge,

    #[error("unexpected EOF")]
    UnexpectedEof,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
