//! HTTP liveness responder.
//!
//! Only the request line is read. `/health` answers 200, every other path
//! answers 404, and the connection is closed after the response.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result, Stage};
use crate::proxy::linger_close;

/// Path answered with `200 OK`.
pub const HEALTH_PATH: &str = "/health";

const HEALTH_OK: &str = "HTTP/1.1 200 OK\r\n\
Content-Type: text/plain\r\n\
Content-Length: 2\r\n\
Connection: close\r\n\
\r\n";

const NOT_FOUND: &str = "HTTP/1.1 404 Not Found\r\n\
Content-Type: text/plain\r\n\
Content-Length: 9\r\n\
Connection: close\r\n\
\r\n";

/// Outcome of routing a request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpRoute {
    /// Liveness check
    Health,
    /// Anything else
    NotFound,
}

impl HttpRoute {
    /// Route a request path. The query string is not part of the match.
    pub fn for_path(path: &str) -> Self {
        let path = path.split_once('?').map_or(path, |(p, _)| p);
        if path == HEALTH_PATH {
            HttpRoute::Health
        } else {
            HttpRoute::NotFound
        }
    }

    /// Full response bytes; `HEAD` requests get headers only.
    pub fn response(self, head_only: bool) -> Vec<u8> {
        let (headers, body) = match self {
            HttpRoute::Health => (HEALTH_OK, "OK"),
            HttpRoute::NotFound => (NOT_FOUND, "Not Found"),
        };
        let mut out = headers.as_bytes().to_vec();
        if !head_only {
            out.extend_from_slice(body.as_bytes());
        }
        out
    }
}

/// Method and path of an HTTP request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine<'a> {
    /// Request method, e.g. `GET`
    pub method: &'a str,
    /// Request target as sent, query included
    pub path: &'a str,
}

/// Split `METHOD PATH [VERSION]` into its parts.
pub fn parse_request_line(line: &str) -> Option<RequestLine<'_>> {
    let mut parts = line.split_ascii_whitespace();
    let method = parts.next()?;
    let path = parts.next()?;
    Some(RequestLine { method, path })
}

/// Read one request line within `limit` and at most `max_len` bytes.
///
/// Stops at the first newline, at `max_len`, or at end-of-stream, whichever
/// comes first. The trailing CR/LF is stripped.
pub async fn read_request_line<S>(stream: &mut S, limit: Duration, max_len: usize) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let read = async {
        let mut buf = vec![0u8; max_len];
        let mut filled = 0;
        while filled < max_len {
            let n = stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
            if buf[..filled].contains(&b'\n') {
                break;
            }
        }
        buf.truncate(filled);
        Ok::<_, std::io::Error>(buf)
    };

    let buf = match tokio::time::timeout(limit, read).await {
        Ok(result) => result?,
        Err(_) => return Err(Error::timeout(Stage::HttpRequest, limit)),
    };

    let line = match buf.iter().position(|&b| b == b'\n') {
        Some(end) => &buf[..end],
        None => &buf[..],
    };
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Ok(String::from_utf8_lossy(line).into_owned())
}

/// Routed liveness request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessRequest {
    /// Response to send
    pub route: HttpRoute,
    /// `HEAD` request: send headers only
    pub head_only: bool,
}

/// Route a request line. A line without a path is a protocol violation
/// and must not be answered.
pub fn route_request_line(line: &str) -> Result<LivenessRequest> {
    let request = parse_request_line(line)
        .ok_or_else(|| Error::invalid(format!("malformed request line {:?}", line)))?;

    Ok(LivenessRequest {
        route: HttpRoute::for_path(request.path),
        head_only: request.method == "HEAD",
    })
}

/// Send the response and close the connection gracefully.
pub async fn write_response<S>(stream: &mut S, request: LivenessRequest, limit: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let response = request.route.response(request.head_only);
    match tokio::time::timeout(limit, stream.write_all(&response)).await {
        Ok(result) => result?,
        Err(_) => return Err(Error::timeout(Stage::HttpResponse, limit)),
    }
    linger_close(stream, limit).await;
    Ok(())
}
