//! Bidirectional byte relay with an inactivity bound.
//!
//! Each direction runs its own copy loop, so a side that is slow to read
//! never holds up bytes flowing the other way. Both loops stamp a shared
//! idle clock whenever bytes move; a watchdog ends the session once the
//! clock has been quiet for the whole idle window.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::time::Instant;

/// Default per-direction buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Relay tuning.
#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    /// Session ends after this long without traffic in either direction
    pub idle_timeout: Duration,
    /// Size of each of the two reusable copy buffers
    pub buffer_size: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Why a relay session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Client side reached end-of-stream
    ClientClosed,
    /// Target side reached end-of-stream
    TargetClosed,
    /// Neither side sent anything within the idle timeout
    IdleTimeout,
    /// A read or write failed on either side
    Error,
}

/// Summary of a finished relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from client to target
    pub client_to_target: u64,
    /// Bytes copied from target to client
    pub target_to_client: u64,
    /// Reason the session ended
    pub end: RelayEnd,
}

/// Relay bytes between `client` and `target` until one closes, fails, or
/// the session goes idle. Both streams are shut down and dropped on return.
pub async fn relay<A, B>(client: A, target: B, options: RelayOptions) -> RelayStats
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut target_rd, mut target_wr) = tokio::io::split(target);

    let clock = IdleClock::new();
    let upstream = AtomicU64::new(0);
    let downstream = AtomicU64::new(0);

    let end = tokio::select! {
        result = pump(&mut client_rd, &mut target_wr, &options, &clock, &upstream) => match result {
            Ok(()) => RelayEnd::ClientClosed,
            Err(e) => {
                tracing::debug!("Relay client->target failed: {}", e);
                RelayEnd::Error
            }
        },
        result = pump(&mut target_rd, &mut client_wr, &options, &clock, &downstream) => match result {
            Ok(()) => RelayEnd::TargetClosed,
            Err(e) => {
                tracing::debug!("Relay target->client failed: {}", e);
                RelayEnd::Error
            }
        },
        _ = clock.expired(options.idle_timeout) => RelayEnd::IdleTimeout,
    };

    close(client_wr).await;
    close(target_wr).await;
    drop((client_rd, target_rd));

    RelayStats {
        client_to_target: upstream.load(Ordering::Relaxed),
        target_to_client: downstream.load(Ordering::Relaxed),
        end,
    }
}

/// Time of the last byte movement in either direction.
struct IdleClock {
    origin: Instant,
    last_ms: AtomicU64,
}

impl IdleClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn last_activity(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }

    /// Completes once `idle` has passed without a `touch`.
    async fn expired(&self, idle: Duration) {
        loop {
            let deadline = self.last_activity() + idle;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

/// Copy one direction until end-of-stream. A single write that cannot
/// complete within the idle window fails the direction.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    options: &RelayOptions,
    clock: &IdleClock,
    copied: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; options.buffer_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        clock.touch();

        match tokio::time::timeout(options.idle_timeout, writer.write_all(&buf[..n])).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "peer stopped reading",
                ))
            }
        }
        copied.fetch_add(n as u64, Ordering::Relaxed);
        clock.touch();
    }
}

async fn close<S>(mut writer: WriteHalf<S>)
where
    S: AsyncWrite,
{
    // Shutdown may stall on a peer that stopped reading; don't wait for it.
    let _ = tokio::time::timeout(Duration::from_secs(1), writer.shutdown()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, ReadBuf};

    fn options(idle: Duration) -> RelayOptions {
        RelayOptions {
            idle_timeout: idle,
            buffer_size: 64,
        }
    }

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (client_side, mut client) = duplex(1024);
        let (target_side, mut target) = duplex(1024);

        let session = tokio::spawn(relay(
            client_side,
            target_side,
            options(Duration::from_secs(5)),
        ));

        let upstream: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let downstream = b"response bytes from the destination".to_vec();

        client.write_all(&upstream).await.unwrap();
        target.write_all(&downstream).await.unwrap();

        let mut got_up = vec![0u8; upstream.len()];
        target.read_exact(&mut got_up).await.unwrap();
        assert_eq!(got_up, upstream);

        let mut got_down = vec![0u8; downstream.len()];
        client.read_exact(&mut got_down).await.unwrap();
        assert_eq!(got_down, downstream);

        drop(client);
        let stats = session.await.unwrap();
        assert_eq!(stats.end, RelayEnd::ClientClosed);
        assert_eq!(stats.client_to_target, upstream.len() as u64);
        assert_eq!(stats.target_to_client, downstream.len() as u64);

        // Target sees the session torn down as well.
        let mut rest = Vec::new();
        target.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_target_close_ends_relay() {
        let (client_side, mut client) = duplex(1024);
        let (target_side, mut target) = duplex(1024);

        let session = tokio::spawn(relay(
            client_side,
            target_side,
            options(Duration::from_secs(5)),
        ));

        target.write_all(b"bye").await.unwrap();
        drop(target);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");

        let stats = session.await.unwrap();
        assert_eq!(stats.end, RelayEnd::TargetClosed);
    }

    #[tokio::test]
    async fn test_destination_writes_before_reading() {
        const LEN: usize = 64 * 1024;

        let (client_side, client) = duplex(1024);
        let (target_side, mut target) = duplex(1024);

        let session = tokio::spawn(relay(
            client_side,
            target_side,
            RelayOptions {
                idle_timeout: Duration::from_secs(2),
                buffer_size: 512,
            },
        ));

        let upload: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();
        let download: Vec<u8> = (0..LEN).map(|i| (i % 241) as u8).collect();

        // The destination sends its whole response before reading anything.
        let expected_upload = upload.clone();
        let response = download.clone();
        let destination = tokio::spawn(async move {
            target.write_all(&response).await.unwrap();
            let mut got = vec![0u8; LEN];
            target.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected_upload);
            target
        });

        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let transfer = async {
            let mut got = vec![0u8; LEN];
            let (sent, received) = tokio::join!(
                client_wr.write_all(&upload),
                client_rd.read_exact(&mut got)
            );
            sent.unwrap();
            received.unwrap();
            got
        };

        let got = tokio::time::timeout(Duration::from_secs(1), transfer)
            .await
            .expect("relay stalled");
        assert_eq!(got, download);

        let target = destination.await.unwrap();
        drop((client_rd, client_wr));

        let stats = session.await.unwrap();
        assert_eq!(stats.end, RelayEnd::ClientClosed);
        assert_eq!(stats.client_to_target, LEN as u64);
        assert_eq!(stats.target_to_client, LEN as u64);
        drop(target);
    }

    /// Destination whose reads never complete and whose writes always fail.
    struct BrokenTarget;

    impl AsyncRead for BrokenTarget {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenTarget {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_write_error_closes_both_sides() {
        let (client_side, mut client) = duplex(1024);

        let session = tokio::spawn(relay(
            client_side,
            BrokenTarget,
            options(Duration::from_secs(5)),
        ));

        client.write_all(b"lost").await.unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(1), session)
            .await
            .expect("relay did not end")
            .unwrap();
        assert_eq!(stats.end, RelayEnd::Error);
        assert_eq!(stats.client_to_target, 0);

        // Client sees end-of-stream, not an error.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (client_side, _client) = duplex(1024);
        let (target_side, _target) = duplex(1024);

        let start = std::time::Instant::now();
        let stats = relay(client_side, target_side, options(Duration::from_millis(100))).await;

        assert_eq!(stats.end, RelayEnd::IdleTimeout);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(stats.client_to_target + stats.target_to_client, 0);
    }

    #[tokio::test]
    async fn test_traffic_rearms_idle_timer() {
        let (client_side, mut client) = duplex(1024);
        let (target_side, mut target) = duplex(1024);

        let session = tokio::spawn(relay(
            client_side,
            target_side,
            options(Duration::from_millis(200)),
        ));

        // Total duration exceeds the idle window, but no gap does.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(80)).await;
            client.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            target.read_exact(&mut buf).await.unwrap();
        }

        let stats = session.await.unwrap();
        assert_eq!(stats.end, RelayEnd::IdleTimeout);
        assert_eq!(stats.client_to_target, 20);
    }
}
