//! Listener and acceptor.
//!
//! A single accept loop owns the listening socket and hands every accepted
//! connection to its own task:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Gateway                              │
//! │  ┌──────────────┐    spawn per connection                    │
//! │  │  TcpListener │ ─────────────────────┐                     │
//! │  │  (PORT)      │                      ▼                     │
//! │  └──────────────┘           ┌──────────────────┐             │
//! │                             │    Dispatcher    │             │
//! │                             │  sniff (peek)    │             │
//! │                             └───┬──────────┬───┘             │
//! │                        HTTP     │          │    SOCKS5       │
//! │                                 ▼          ▼                 │
//! │                        ┌────────────┐ ┌──────────────────┐   │
//! │                        │ /health    │ │ negotiate        │   │
//! │                        │ 200 / 404  │ │ connect → relay  │   │
//! │                        └────────────┘ └──────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
mod dispatch;
mod metrics;

pub use config::{GatewayConfig, GatewayConfigFile};
pub use dispatch::Dispatcher;
pub use metrics::{GatewayMetrics, MetricsSnapshot};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

use crate::error::Result;

/// Pause after a failed accept, so descriptor exhaustion cannot spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Poll interval while draining connections at shutdown.
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Main gateway instance.
pub struct Server {
    config: Arc<GatewayConfig>,
    metrics: Arc<GatewayMetrics>,
    dispatcher: Arc<Dispatcher>,
    listener: TcpListener,
}

impl Server {
    /// Validate the configuration and bind the listening socket.
    ///
    /// Bind failure is the only fatal error of the gateway.
    pub async fn bind(config: GatewayConfig) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.bind_addr()).await?;
        tracing::info!("Gateway listening on {}", listener.local_addr()?);

        let config = Arc::new(config);
        let metrics = Arc::new(GatewayMetrics::new());

        Ok(Self {
            dispatcher: Arc::new(Dispatcher::new(
                Arc::clone(&config),
                Arc::clone(&metrics),
            )),
            config,
            metrics,
            listener,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared metrics handle.
    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Accept connections until `shutdown` completes, then drain.
    ///
    /// After shutdown no new connections are accepted; in-flight sessions
    /// get up to `drain_timeout` to finish on their own.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Server {
            config,
            metrics,
            dispatcher,
            listener,
        } = self;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("Accepted connection from {}", peer);
                        spawn_dispatch(&dispatcher, &metrics, stream, peer);
                    }
                    Err(e) => {
                        tracing::warn!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }

        drop(listener);
        drain(&metrics, config.drain_timeout).await;
        tracing::info!("\n{}", metrics.format_report());

        Ok(())
    }
}

/// Keeps the active-connection gauge accurate on every exit path,
/// unwinding included.
struct ActiveConnection(Arc<GatewayMetrics>);

impl ActiveConnection {
    fn open(metrics: &Arc<GatewayMetrics>) -> Self {
        metrics.increment_connections();
        Self(Arc::clone(metrics))
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.decrement_connections();
    }
}

fn spawn_dispatch(
    dispatcher: &Arc<Dispatcher>,
    metrics: &Arc<GatewayMetrics>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let guard = ActiveConnection::open(metrics);
    let dispatcher = Arc::clone(dispatcher);

    let task = tokio::spawn(async move {
        let _guard = guard;
        dispatcher.dispatch(stream, peer).await;
    });

    // A panic unwinds the dispatch task only; report it here.
    tokio::spawn(async move {
        if let Err(e) = task.await {
            if e.is_panic() {
                tracing::error!("Dispatch task for {} panicked", peer);
            }
        }
    });
}

async fn drain(metrics: &GatewayMetrics, limit: Duration) {
    let deadline = Instant::now() + limit;
    while metrics.active_connections() > 0 && Instant::now() < deadline {
        tokio::time::sleep(DRAIN_POLL).await;
    }

    let remaining = metrics.active_connections();
    if remaining > 0 {
        tracing::info!("Stopping with {} connections still open", remaining);
    }
}
