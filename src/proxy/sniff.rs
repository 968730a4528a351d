//! Protocol sniffing.
//!
//! Peeks at the leading bytes of a freshly accepted connection and decides
//! which handler owns it. The peeked bytes stay in the socket's receive
//! buffer, so the chosen handler parses the stream from its first byte.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::error::Result;
use crate::proxy::socks5::SOCKS_VERSION;

/// Number of leading bytes needed to recognise an HTTP method.
pub const SNIFF_LEN: usize = 3;

/// HTTP method prefixes recognised by the sniffer.
const HTTP_PREFIXES: [&[u8; SNIFF_LEN]; 3] = [b"GET", b"POS", b"HEA"];

/// First delay between peeks while a partial prefix is buffered.
const PEEK_RETRY_INITIAL: Duration = Duration::from_millis(10);

/// Longest delay between peeks of a partial prefix.
const PEEK_RETRY_MAX: Duration = Duration::from_millis(250);

/// Retry delays double up to [`PEEK_RETRY_MAX`], so a peer that stalls
/// mid-prefix costs a handful of wakeups per sniff window.
fn next_retry(current: Duration) -> Duration {
    (current * 2).min(PEEK_RETRY_MAX)
}

/// Protocol spoken by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// SOCKS5 proxy request
    Socks5,
    /// HTTP request (liveness check)
    Http,
    /// Anything else
    Unknown,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Socks5 => f.write_str("socks5"),
            Protocol::Http => f.write_str("http"),
            Protocol::Unknown => f.write_str("unknown"),
        }
    }
}

/// Classification verdict plus the bytes it was based on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffResult {
    /// Detected protocol
    pub protocol: Protocol,
    /// Peeked prefix, still unread on the stream
    pub prefix: Vec<u8>,
}

/// Result of classifying a prefix that may still be incomplete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Decided(Protocol),
    NeedMore,
}

fn verdict(prefix: &[u8]) -> Verdict {
    match prefix.first() {
        None => Verdict::NeedMore,
        Some(&SOCKS_VERSION) => Verdict::Decided(Protocol::Socks5),
        Some(_) if prefix.len() < SNIFF_LEN => {
            // A byte that cannot start any known method settles it early.
            if HTTP_PREFIXES.iter().any(|p| p.starts_with(prefix)) {
                Verdict::NeedMore
            } else {
                Verdict::Decided(Protocol::Unknown)
            }
        }
        Some(_) => Verdict::Decided(classify(prefix)),
    }
}

/// Classify a complete prefix.
pub fn classify(prefix: &[u8]) -> Protocol {
    if prefix.first() == Some(&SOCKS_VERSION) {
        return Protocol::Socks5;
    }
    if prefix.len() >= SNIFF_LEN && HTTP_PREFIXES.iter().any(|p| &prefix[..SNIFF_LEN] == *p) {
        return Protocol::Http;
    }
    Protocol::Unknown
}

/// Peek at a connection and classify it without consuming any bytes.
///
/// Returns `Ok(None)` when the peer closes before sending anything. When
/// `wait` expires before a decision, the connection is classified as
/// [`Protocol::Unknown`] with whatever prefix had arrived.
pub async fn sniff(stream: &TcpStream, wait: Duration) -> Result<Option<SniffResult>> {
    let deadline = Instant::now() + wait;
    let mut buf = [0u8; SNIFF_LEN];
    let mut seen = 0;
    let mut retry = PEEK_RETRY_INITIAL;

    loop {
        let n = match tokio::time::timeout_at(deadline, stream.peek(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::debug!("No protocol decision within {:?}", wait);
                return Ok(Some(SniffResult {
                    protocol: Protocol::Unknown,
                    prefix: buf[..seen].to_vec(),
                }));
            }
        };

        if n == 0 {
            return Ok(None);
        }
        seen = n;

        let prefix = &buf[..n];
        match verdict(prefix) {
            Verdict::Decided(protocol) => {
                return Ok(Some(SniffResult {
                    protocol,
                    prefix: prefix.to_vec(),
                }));
            }
            Verdict::NeedMore => {
                if Instant::now() >= deadline {
                    tracing::debug!("Partial prefix {:02x?} at sniff deadline", prefix);
                    return Ok(Some(SniffResult {
                        protocol: Protocol::Unknown,
                        prefix: prefix.to_vec(),
                    }));
                }
                // peek() completes at once while data is buffered, and socket
                // readiness stays set with it, so wait on a timer instead.
                tokio::time::sleep_until((Instant::now() + retry).min(deadline)).await;
                retry = next_retry(retry);
            }
        }
    }
}
