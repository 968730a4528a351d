//! Per-connection dispatch.
//!
//! One [`Dispatcher::dispatch`] call owns one accepted client stream from
//! sniffing to close. Every phase returns a `Result`; errors stop at this
//! boundary as a log line and a dropped socket.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;

use super::config::GatewayConfig;
use super::metrics::GatewayMetrics;
use crate::error::{Error, Result};
use crate::proxy::http::{self, HttpRoute};
use crate::proxy::{relay, sniff, Connector, Negotiator, Protocol, RelayOptions};

/// Routes accepted connections to the HTTP or SOCKS5 handler.
pub struct Dispatcher {
    config: Arc<GatewayConfig>,
    metrics: Arc<GatewayMetrics>,
    connector: Connector,
}

impl Dispatcher {
    /// Create a dispatcher sharing the server's configuration and metrics.
    pub fn new(config: Arc<GatewayConfig>, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            connector: Connector::new(config.connect_timeout),
            config,
            metrics,
        }
    }

    /// Serve one client connection to completion.
    ///
    /// The stream is dropped, and therefore closed, on every return path.
    pub async fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = self.handle(stream, peer).await {
            log_failure(peer, &e);
        }
    }

    async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nodelay(true)?;

        let sniffed = match sniff(&stream, self.config.sniff_timeout).await? {
            Some(sniffed) => sniffed,
            None => {
                tracing::debug!("{} closed before sending any data", peer);
                return Ok(());
            }
        };

        self.metrics.record_protocol(sniffed.protocol);
        tracing::debug!("{} classified as {}", peer, sniffed.protocol);

        match sniffed.protocol {
            Protocol::Http => self.handle_http(stream).await,
            Protocol::Socks5 => self.handle_socks5(stream, peer).await,
            Protocol::Unknown => {
                tracing::debug!("Closing {} (prefix {:02x?})", peer, sniffed.prefix);
                Ok(())
            }
        }
    }

    async fn handle_http(&self, mut stream: TcpStream) -> Result<()> {
        let limit = self.config.http_read_timeout;
        let line =
            http::read_request_line(&mut stream, limit, self.config.http_max_request_line).await?;
        let request = http::route_request_line(&line)?;

        if request.route == HttpRoute::Health {
            self.metrics.increment_health_checks();
        }
        tracing::debug!("{:?} -> {:?}", line, request.route);

        http::write_response(&mut stream, request, limit).await
    }

    async fn handle_socks5(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut negotiator = Negotiator::new(stream, self.config.handshake_timeout);

        if let Err(e) = negotiator.greet().await {
            self.metrics.increment_handshake_errors();
            return Err(e);
        }

        let request = match negotiator.read_request().await {
            Ok(request) => request,
            Err(e) => {
                self.metrics.increment_handshake_errors();
                negotiator.reply_failure().await;
                return Err(e);
            }
        };

        tracing::info!("{} CONNECT {}", peer, request.destination());

        let target = match self.connector.connect(&request).await {
            Ok(target) => target,
            Err(e) => {
                self.metrics.increment_connect_failures();
                negotiator.reply_failure().await;
                return Err(e);
            }
        };

        negotiator.reply_success().await?;

        let options = RelayOptions {
            idle_timeout: self.config.idle_timeout,
            buffer_size: self.config.relay_buffer_size,
        };
        let stats = relay(negotiator.into_inner(), target, options).await;
        self.metrics.record_relay(&stats);

        tracing::debug!(
            "{} <-> {} closed ({:?}): {} bytes up, {} bytes down",
            peer,
            request.destination(),
            stats.end,
            stats.client_to_target,
            stats.target_to_client
        );
        Ok(())
    }
}

/// Kind of per-connection failure, deciding how it is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    /// Destination could not be resolved or reached
    Unreachable,
    /// Peer stopped making progress within a bound
    Stalled,
    /// Peer sent bytes outside the supported protocol subset
    Violation,
    /// Socket-level error
    Transport,
}

impl Failure {
    fn of(err: &Error) -> Self {
        if err.is_connect_failure() {
            Failure::Unreachable
        } else if err.is_timeout() {
            Failure::Stalled
        } else if err.is_protocol_violation() {
            Failure::Violation
        } else {
            Failure::Transport
        }
    }
}

fn log_failure(peer: SocketAddr, err: &Error) {
    match Failure::of(err) {
        Failure::Unreachable => tracing::info!("{}: {}", peer, err),
        Failure::Stalled => tracing::debug!("{} stalled: {}", peer, err),
        Failure::Violation => tracing::debug!("Protocol violation from {}: {}", peer, err),
        Failure::Transport => tracing::debug!("Connection error from {}: {}", peer, err),
    }
}
