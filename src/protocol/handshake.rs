//! HTTP upgrade handshake
//!
//! Reads the client's opening request from a freshly accepted socket, checks
//! that it asks for a WebSocket upgrade and answers with
//! `101 Switching Protocols`.

use base64::prelude::*;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Fixed GUID appended to the client key (RFC 6455 section 1.3)
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default upper bound for the upgrade request head (8 KiB)
pub const DEFAULT_MAX_HANDSHAKE_SIZE: usize = 8 * 1024;

/// Sent before dropping a client whose upgrade request was refused
pub const BAD_REQUEST_RESPONSE: &str =
    "HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Errors that can occur while negotiating the upgrade
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Missing 'Upgrade: websocket' header")]
    MissingUpgrade,

    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("Malformed upgrade request: {0}")]
    Malformed(String),

    #[error("Upgrade request exceeds {0} bytes")]
    TooLarge(usize),

    #[error("Connection closed before handshake")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for handshake operations
pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// A parsed upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Request target, e.g. `/` or `/ws`
    pub path: String,
    /// Value of `Sec-WebSocket-Key`
    pub key: String,
    /// All headers in arrival order
    pub headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    /// Parse a request head (request line plus headers, without the blank line)
    pub fn parse(head: &str) -> HandshakeResult<Self> {
        let mut lines = head.split("\r\n");

        let request_line = lines
            .next()
            .filter(|line| !line.is_empty())
            .ok_or_else(|| HandshakeError::Malformed("empty request".to_string()))?;

        let mut parts = request_line.split_whitespace();
        let (method, path, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(path), Some(version)) => (method, path, version),
            _ => {
                return Err(HandshakeError::Malformed(format!(
                    "bad request line '{}'",
                    request_line
                )))
            }
        };
        if method != "GET" {
            return Err(HandshakeError::Malformed(format!(
                "method {} is not GET",
                method
            )));
        }
        if !version.starts_with("HTTP/") {
            return Err(HandshakeError::Malformed(format!(
                "unknown protocol version '{}'",
                version
            )));
        }

        let mut headers = Vec::new();
        for line in lines.filter(|line| !line.is_empty()) {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                HandshakeError::Malformed(format!("bad header line '{}'", line))
            })?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let upgrade = headers.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case("upgrade")
                && value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
        });
        if !upgrade {
            return Err(HandshakeError::MissingUpgrade);
        }

        let key = find_header(&headers, "sec-websocket-key")
            .filter(|key| !key.is_empty())
            .ok_or(HandshakeError::MissingKey)?
            .to_string();

        Ok(Self {
            path: path.to_string(),
            key,
            headers,
        })
    }

    /// Look up a header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// The `101 Switching Protocols` response for this request
    pub fn response(&self) -> String {
        switching_protocols_response(&self.key)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header, _)| header.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Compute `Sec-WebSocket-Accept` for a client key
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Build the `101 Switching Protocols` response for a client key
pub fn switching_protocols_response(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(key)
    )
}

/// Read the upgrade request head from `reader`
///
/// Most clients deliver the whole head in one read; further reads happen only
/// until the blank line arrives or `max_size` bytes have been buffered.
pub async fn read_request<R>(reader: &mut R, max_size: usize) -> HandshakeResult<UpgradeRequest>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(if buf.is_empty() {
                HandshakeError::Closed
            } else {
                HandshakeError::Malformed("request ended before blank line".to_string())
            });
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = buf
            .windows(HEADER_TERMINATOR.len())
            .position(|window| window == HEADER_TERMINATOR)
        {
            if end > max_size {
                return Err(HandshakeError::TooLarge(max_size));
            }
            let head = std::str::from_utf8(&buf[..end])
                .map_err(|_| HandshakeError::Malformed("request is not valid UTF-8".to_string()))?;
            return UpgradeRequest::parse(head);
        }

        if buf.len() > max_size {
            return Err(HandshakeError::TooLarge(max_size));
        }
    }
}

/// Run the server side of the opening handshake on `stream`
///
/// On failure a `400 Bad Request` is written (best effort) and the error is
/// returned; the caller is expected to drop the connection.
pub async fn negotiate<S>(stream: &mut S, max_size: usize) -> HandshakeResult<UpgradeRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match read_request(stream, max_size).await {
        Ok(request) => request,
        Err(e) => {
            if !matches!(e, HandshakeError::Closed | HandshakeError::Io(_)) {
                let _ = stream.write_all(BAD_REQUEST_RESPONSE.as_bytes()).await;
                let _ = stream.flush().await;
            }
            return Err(e);
        }
    };

    stream.write_all(request.response().as_bytes()).await?;
    stream.flush().await?;
    Ok(request)
}
