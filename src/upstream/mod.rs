//! HTTP/1.1 client for the configured upstream origin.
//!
//! One fresh connection per forwarded request, always `Connection: close`.
//! Response heads are parsed with [`httparse`] using the same incremental
//! push-parse loop as the inbound side; bodies are framed by
//! `Content-Length`, chunked transfer coding, or connection close.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::http::{Headers, Method};

/// The single origin all forwarded requests target. Static for the process
/// lifetime.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    host: String,
    port: u16,
}

impl UpstreamTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, the form used for both connecting and the `Host` header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Errors from a single upstream exchange.
///
/// `Connect` and `TimedOut` are kept distinct so the proxy can answer 502
/// versus 504; everything else collapses into pass-through failure handling.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to connect to upstream {authority}: {source}")]
    Connect {
        authority: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream exchange exceeded {0:?}")]
    TimedOut(Duration),

    #[error("I/O error talking to upstream: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed upstream response: {0}")]
    Malformed(&'static str),
}

/// A fully received upstream response: head plus decoded body.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

/// HTTP/1.1 client bound to one [`UpstreamTarget`].
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    target: UpstreamTarget,
    timeout: Duration,
}

impl UpstreamClient {
    /// Maximum number of response headers we accept from the origin.
    const MAX_HEADERS: usize = 64;

    /// Initial read buffer capacity per exchange.
    const INITIAL_BUF_SIZE: usize = 8192;

    pub fn new(target: UpstreamTarget, timeout: Duration) -> Self {
        Self { target, timeout }
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    /// Performs one request/response exchange with the origin.
    ///
    /// `headers` must already be rewritten for forwarding (hop-by-hop headers
    /// stripped, `Via`/`X-Forwarded-For` added); this method owns the wire
    /// concerns: `Host`, `Connection: close`, and `Content-Length` framing
    /// for the outgoing body.
    ///
    /// The whole exchange shares one deadline; exceeding it returns
    /// [`UpstreamError::TimedOut`].
    pub async fn fetch(
        &self,
        method: &Method,
        target: &str,
        headers: &Headers,
        body: &[u8],
    ) -> Result<UpstreamResponse, UpstreamError> {
        tokio::time::timeout(self.timeout, self.exchange(method, target, headers, body))
            .await
            .map_err(|_| UpstreamError::TimedOut(self.timeout))?
    }

    async fn exchange(
        &self,
        method: &Method,
        target: &str,
        headers: &Headers,
        body: &[u8],
    ) -> Result<UpstreamResponse, UpstreamError> {
        let authority = self.target.authority();
        let mut stream =
            TcpStream::connect(&authority)
                .await
                .map_err(|source| UpstreamError::Connect {
                    authority: authority.clone(),
                    source,
                })?;

        let request = serialize_request(method, target, &authority, headers, body);
        stream.write_all(&request).await?;
        stream.flush().await?;

        debug!(%method, target, upstream = %authority, "forwarded to upstream");
        read_response(&mut stream, method == &Method::Head).await
    }
}

/// Serializes the outgoing request in HTTP/1.1 wire format.
fn serialize_request(
    method: &Method,
    target: &str,
    authority: &str,
    headers: &Headers,
    body: &[u8],
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256 + headers.len() * 64 + body.len());
    buf.extend_from_slice(format!("{} {} HTTP/1.1\r\n", method.as_str(), target).as_bytes());
    buf.extend_from_slice(format!("Host: {authority}\r\n").as_bytes());
    for (name, value) in headers.iter() {
        // Host and framing are written by us, whatever the client sent.
        if matches!(
            name.to_ascii_lowercase().as_str(),
            "host" | "content-length" | "transfer-encoding" | "connection"
        ) {
            continue;
        }
        buf.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !body.is_empty() {
        buf.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    buf.extend_from_slice(b"Connection: close\r\n\r\n");
    buf.extend_from_slice(body);
    buf
}

/// Reads and parses a complete response from `stream`.
///
/// Generic over the reader so body-framing behavior is testable against
/// in-memory byte slices.
async fn read_response<R>(stream: &mut R, head_request: bool) -> Result<UpstreamResponse, UpstreamError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(UpstreamClient::INITIAL_BUF_SIZE);

    // Incremental head parse: keep reading until httparse sees the blank
    // line, mirroring the inbound request loop.
    let (status, headers, body_offset) = loop {
        let mut header_buf = [httparse::EMPTY_HEADER; UpstreamClient::MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut header_buf);
        match parsed.parse(&buf) {
            Ok(httparse::Status::Complete(offset)) => {
                let status = parsed.code.ok_or(UpstreamError::Malformed("no status code"))?;
                let mut headers = Headers::with_capacity(parsed.headers.len());
                for header in parsed.headers.iter() {
                    if let Ok(value) = std::str::from_utf8(header.value) {
                        headers.insert(header.name, value);
                    }
                }
                break (status, headers, offset);
            }
            Ok(httparse::Status::Partial) => {
                let n = stream.read_buf(&mut buf).await?;
                if n == 0 {
                    return Err(UpstreamError::Malformed("connection closed during headers"));
                }
            }
            Err(_) => return Err(UpstreamError::Malformed("unparseable response head")),
        }
    };

    let _ = buf.split_to(body_offset);

    // Bodyless by definition: HEAD replies and 1xx/204/304 statuses, no
    // matter what framing headers claim.
    if head_request || status < 200 || status == 204 || status == 304 {
        return Ok(UpstreamResponse {
            status,
            headers,
            body: Bytes::new(),
        });
    }

    let chunked = headers
        .get("transfer-encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));

    let body = if chunked {
        read_chunked_body(stream, &mut buf).await?
    } else if let Some(len) = headers.get("content-length").and_then(|v| v.parse().ok()) {
        read_sized_body(stream, &mut buf, len).await?
    } else {
        // No framing: the origin delimits the body by closing the connection.
        read_to_close(stream, &mut buf).await?
    };

    Ok(UpstreamResponse {
        status,
        headers,
        body,
    })
}

async fn read_sized_body<R>(
    stream: &mut R,
    buf: &mut BytesMut,
    len: usize,
) -> Result<Bytes, UpstreamError>
where
    R: AsyncRead + Unpin,
{
    while buf.len() < len {
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(UpstreamError::Malformed("connection closed mid-body"));
        }
    }
    Ok(buf.split_to(len).freeze())
}

async fn read_to_close<R>(stream: &mut R, buf: &mut BytesMut) -> Result<Bytes, UpstreamError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Ok(buf.split().freeze());
        }
    }
}

/// Decodes a chunked transfer coding (RFC 9112 §7.1) into the bare body.
///
/// Trailer fields after the last chunk are read and dropped.
async fn read_chunked_body<R>(stream: &mut R, buf: &mut BytesMut) -> Result<Bytes, UpstreamError>
where
    R: AsyncRead + Unpin,
{
    let mut body = BytesMut::new();
    loop {
        let line = read_line(stream, buf).await?;
        let size_text = line
            .split(';') // chunk extensions are ignored
            .next()
            .unwrap_or("")
            .trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| UpstreamError::Malformed("bad chunk size"))?;

        if size == 0 {
            // Consume trailer section up to the terminating empty line.
            loop {
                if read_line(stream, buf).await?.is_empty() {
                    return Ok(body.freeze());
                }
            }
        }

        while buf.len() < size + 2 {
            let n = stream.read_buf(buf).await?;
            if n == 0 {
                return Err(UpstreamError::Malformed("connection closed mid-chunk"));
            }
        }
        body.extend_from_slice(&buf.split_to(size));
        let crlf = buf.split_to(2);
        if &crlf[..] != b"\r\n" {
            return Err(UpstreamError::Malformed("missing chunk terminator"));
        }
    }
}

/// Reads one CRLF-terminated line, returning it without the terminator.
async fn read_line<R>(stream: &mut R, buf: &mut BytesMut) -> Result<String, UpstreamError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf.split_to(pos);
            let _ = buf.split_to(2);
            return String::from_utf8(line.to_vec())
                .map_err(|_| UpstreamError::Malformed("non-UTF-8 chunk framing"));
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(UpstreamError::Malformed("connection closed mid-line"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(raw: &[u8], head: bool) -> Result<UpstreamResponse, UpstreamError> {
        let mut reader = raw;
        read_response(&mut reader, head).await
    }

    #[tokio::test]
    async fn content_length_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello";
        let resp = parse(raw, false).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.headers.get("content-type"), Some("text/plain"));
        assert_eq!(resp.body.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn chunked_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                    5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let resp = parse(raw, false).await.unwrap();
        assert_eq!(resp.body.as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn chunked_body_with_extension_and_trailer() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                    4;ext=1\r\nwiki\r\n0\r\nExpires: soon\r\n\r\n";
        let resp = parse(raw, false).await.unwrap();
        assert_eq!(resp.body.as_ref(), b"wiki");
    }

    #[tokio::test]
    async fn body_delimited_by_close() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\neverything until eof";
        let resp = parse(raw, false).await.unwrap();
        assert_eq!(resp.body.as_ref(), b"everything until eof");
    }

    #[tokio::test]
    async fn head_response_has_no_body() {
        // Content-Length describes the GET representation; nothing follows.
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5000\r\n\r\n";
        let resp = parse(raw, true).await.unwrap();
        assert!(resp.body.is_empty());
    }

    #[tokio::test]
    async fn not_modified_has_no_body() {
        let raw = b"HTTP/1.1 304 Not Modified\r\nETag: \"v2\"\r\n\r\n";
        let resp = parse(raw, false).await.unwrap();
        assert_eq!(resp.status, 304);
        assert_eq!(resp.headers.get("etag"), Some("\"v2\""));
        assert!(resp.body.is_empty());
    }

    #[tokio::test]
    async fn truncated_head_is_malformed() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Len";
        assert!(matches!(
            parse(raw, false).await,
            Err(UpstreamError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn truncated_sized_body_is_malformed() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort";
        assert!(matches!(
            parse(raw, false).await,
            Err(UpstreamError::Malformed(_))
        ));
    }

    #[test]
    fn serialized_request_shape() {
        let mut headers = Headers::new();
        headers.insert("Accept", "*/*");
        headers.insert("Connection", "keep-alive"); // rewritten by the client
        headers.insert("Host", "public.example.com"); // replaced with the origin

        let raw = serialize_request(&Method::Get, "/a?b=1", "origin:8080", &headers, b"");
        let text = std::str::from_utf8(&raw).unwrap();
        assert!(text.starts_with("GET /a?b=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: origin:8080\r\n"));
        assert!(text.contains("Accept: */*\r\n"));
        assert!(!text.contains("public.example.com"));
        assert!(text.ends_with("Connection: close\r\n\r\n"));
        assert_eq!(text.matches("Connection").count(), 1);
    }

    #[test]
    fn serialized_request_with_body_has_content_length() {
        let raw = serialize_request(&Method::Post, "/submit", "origin:8080", &Headers::new(), b"abc");
        let text = std::str::from_utf8(&raw).unwrap();
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.ends_with("\r\n\r\nabc"));
    }
}
