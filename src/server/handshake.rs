//! HTTP upgrade negotiation
//!
//! Reads the client's upgrade request off a freshly accepted socket, validates
//! it, and answers with either `101 Switching Protocols` or an HTTP error
//! response. Error responses always close the connection.

use base64::prelude::*;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::error::HandshakeError;

/// GUID appended to the client key before hashing
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version we speak
pub const WEBSOCKET_VERSION: &str = "13";

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

const READ_CHUNK: usize = 1024;

/// Compute `Sec-WebSocket-Accept` for a client key
pub fn accept_key(client_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(client_key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Parsed HTTP request head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl HandshakeRequest {
    /// Parse a request head, terminator included or not
    pub fn parse(head: &[u8]) -> Result<Self, HandshakeError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| HandshakeError::Malformed("request head is not valid UTF-8".into()))?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let (method, target, version) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(m), Some(t), Some(v), None) if !m.is_empty() && !t.is_empty() => (m, t, v),
                _ => {
                    return Err(HandshakeError::Malformed(format!(
                        "bad request line {request_line:?}"
                    )))
                }
            };
        if version != "HTTP/1.1" {
            return Err(HandshakeError::Malformed(format!(
                "unsupported HTTP version {version:?}"
            )));
        }

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HandshakeError::Malformed(format!("bad header line {line:?}")))?;
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(HandshakeError::Malformed(format!("bad header name {name:?}")));
            }
            headers.push((name.to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a comma-separated header contains a token
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Request path without the query string
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or_default()
    }
}

/// A completed upgrade
#[derive(Debug)]
pub struct Upgrade {
    pub request: HandshakeRequest,
    pub accept: String,
    /// Bytes the client sent after the request head (already WebSocket frames)
    pub leftover: Vec<u8>,
}

/// Validates upgrade requests and writes the HTTP response
#[derive(Debug, Clone)]
pub struct Negotiator {
    path: Option<String>,
    max_header_size: usize,
}

impl Negotiator {
    pub fn new(path: Option<String>, max_header_size: usize) -> Self {
        Self {
            path,
            max_header_size,
        }
    }

    /// Run the handshake on a socket.
    ///
    /// On success the 101 response has been flushed and the socket is ready for
    /// WebSocket framing. On failure an error response (when one applies) has
    /// been sent and the write side shut down.
    pub async fn accept<S>(&self, stream: &mut S) -> Result<Upgrade, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.read_and_validate(stream).await {
            Ok(upgrade) => {
                stream
                    .write_all(&switching_protocols(&upgrade.accept))
                    .await?;
                stream.flush().await?;
                Ok(upgrade)
            }
            Err(err) => {
                if let Some(response) = rejection(&err) {
                    if let Err(e) = stream.write_all(&response).await {
                        debug!("Failed to send handshake rejection: {}", e);
                    }
                    let _ = stream.flush().await;
                }
                let _ = stream.shutdown().await;
                Err(err)
            }
        }
    }

    async fn read_and_validate<S>(&self, stream: &mut S) -> Result<Upgrade, HandshakeError>
    where
        S: AsyncRead + Unpin,
    {
        let (head, leftover) = read_request_head(stream, self.max_header_size).await?;
        let request = HandshakeRequest::parse(&head)?;
        let accept = self.validate(&request)?;
        Ok(Upgrade {
            request,
            accept,
            leftover,
        })
    }

    /// Check a parsed request, returning the accept key
    pub fn validate(&self, request: &HandshakeRequest) -> Result<String, HandshakeError> {
        if request.method != "GET" {
            return Err(HandshakeError::InvalidMethod(request.method.clone()));
        }
        if let Some(path) = &self.path {
            if request.path() != path.as_str() {
                return Err(HandshakeError::NotFound(request.path().to_string()));
            }
        }
        if !request.has_token("Upgrade", "websocket") {
            return Err(HandshakeError::UpgradeRequired(
                "missing Upgrade: websocket header".into(),
            ));
        }
        if !request.has_token("Connection", "upgrade") {
            return Err(HandshakeError::UpgradeRequired(
                "missing Connection: Upgrade header".into(),
            ));
        }
        match request.header("Sec-WebSocket-Version") {
            Some(WEBSOCKET_VERSION) => {}
            Some(other) => {
                return Err(HandshakeError::UpgradeRequired(format!(
                    "unsupported Sec-WebSocket-Version {other}"
                )))
            }
            None => {
                return Err(HandshakeError::UpgradeRequired(
                    "missing Sec-WebSocket-Version header".into(),
                ))
            }
        }

        let key = request.header("Sec-WebSocket-Key").ok_or_else(|| {
            HandshakeError::UpgradeRequired("missing Sec-WebSocket-Key header".into())
        })?;
        match BASE64_STANDARD.decode(key) {
            Ok(nonce) if nonce.len() == 16 => Ok(accept_key(key)),
            Ok(nonce) => Err(HandshakeError::InvalidKey(format!(
                "expected 16 bytes, got {}",
                nonce.len()
            ))),
            Err(_) => Err(HandshakeError::InvalidKey("not valid base64".into())),
        }
    }
}

/// Read up to and including the blank line ending the request head.
///
/// Returns the head and whatever followed it in the last read.
pub async fn read_request_head<S>(
    stream: &mut S,
    max_header_size: usize,
) -> Result<(Vec<u8>, Vec<u8>), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(if buf.is_empty() {
                HandshakeError::Disconnected
            } else {
                HandshakeError::Malformed("connection closed inside request head".into())
            });
        }

        // The terminator may straddle two reads
        let search_from = buf.len().saturating_sub(HEAD_TERMINATOR.len() - 1);
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = buf[search_from..]
            .windows(HEAD_TERMINATOR.len())
            .position(|w| w == HEAD_TERMINATOR)
        {
            let end = search_from + pos + HEAD_TERMINATOR.len();
            if end > max_header_size {
                return Err(HandshakeError::HeaderTooLarge(max_header_size));
            }
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }

        if buf.len() > max_header_size {
            return Err(HandshakeError::HeaderTooLarge(max_header_size));
        }
    }
}

/// `101 Switching Protocols` response bytes
pub fn switching_protocols(accept: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    )
    .into_bytes()
}

/// Error response bytes for a rejected handshake, if the error warrants one
pub fn rejection(err: &HandshakeError) -> Option<Vec<u8>> {
    let (code, reason) = err.status()?;
    let body = format!("{code} {reason}");
    let mut response = format!("HTTP/1.1 {code} {reason}\r\n");
    if code == 426 {
        response.push_str(&format!("Sec-WebSocket-Version: {WEBSOCKET_VERSION}\r\n"));
    }
    response.push_str(&format!(
        "Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    ));
    Some(response.into_bytes())
}
