//! Protocol handlers behind the shared listening port.
//!
//! Sniffing decides the protocol; HTTP connections get the liveness
//! responder, SOCKS5 connections are negotiated, connected and relayed.

pub mod connect;
pub mod http;
pub mod relay;
pub mod sniff;
pub mod socks5;

pub use connect::Connector;
pub use http::HttpRoute;
pub use relay::{relay, RelayEnd, RelayOptions, RelayStats};
pub use sniff::{sniff, Protocol, SniffResult};
pub use socks5::{Negotiator, NegotiatorState, SocksRequest, TargetAddr};

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest wait for the peer to close after our final write.
const LINGER_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on input discarded while lingering.
const MAX_LINGER_DRAIN: usize = 64 * 1024;

/// Close the write side after a final reply, then discard input until the
/// peer closes or the linger bound passes.
///
/// Closing a socket with unread input makes the kernel send a reset, which
/// can destroy the reply before the peer reads it.
pub(crate) async fn linger_close<S>(stream: &mut S, limit: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let limit = LINGER_TIMEOUT.min(limit);
    if tokio::time::timeout(limit, stream.shutdown()).await.is_err() {
        return;
    }

    let drain = async {
        let mut scratch = [0u8; 1024];
        let mut total = 0;
        while total < MAX_LINGER_DRAIN {
            match stream.read(&mut scratch).await {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n,
            }
        }
    };
    let _ = tokio::time::timeout(limit, drain).await;
}
