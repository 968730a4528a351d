//! Destination connector.
//!
//! Opens the outbound TCP connection for a SOCKS5 CONNECT request. Domain
//! names are resolved per request, without caching.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{Error, Result, Stage};
use crate::proxy::socks5::{SocksRequest, TargetAddr};

/// Connects to SOCKS5 destinations within a fixed time bound.
#[derive(Debug, Clone, Copy)]
pub struct Connector {
    timeout: Duration,
}

impl Connector {
    /// Create a connector whose resolve + connect is bounded by `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Open a connection to the request's destination.
    pub async fn connect(&self, request: &SocksRequest) -> Result<TcpStream> {
        match tokio::time::timeout(self.timeout, self.open(&request.target, request.port)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(Stage::Connect, self.timeout)),
        }
    }

    async fn open(&self, target: &TargetAddr, port: u16) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = match target {
            TargetAddr::Ipv4(ip) => vec![SocketAddr::from((*ip, port))],
            TargetAddr::Domain(host) => resolve(host, port).await?,
        };

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    tracing::debug!("Connected to {}:{} via {}", target, port, addr);
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::trace!("Connect attempt to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(Error::Connect {
            target: format!("{}:{}", target, port),
            source: last_err.unwrap_or_else(|| std::io::ErrorKind::AddrNotAvailable.into()),
        })
    }
}

async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| Error::Resolve {
            host: host.to_string(),
            source,
        })?
        .collect();

    if addrs.is_empty() {
        return Err(Error::Resolve {
            host: host.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found"),
        });
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::socks5::{ATYP_DOMAIN, ATYP_IPV4, CMD_CONNECT, SOCKS_VERSION};
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    fn request(target: TargetAddr, port: u16) -> SocksRequest {
        let address_type = match target {
            TargetAddr::Ipv4(_) => ATYP_IPV4,
            TargetAddr::Domain(_) => ATYP_DOMAIN,
        };
        SocksRequest {
            version: SOCKS_VERSION,
            command: CMD_CONNECT,
            address_type,
            target,
            port,
        }
    }

    #[tokio::test]
    async fn test_connect_ipv4() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = Connector::new(Duration::from_secs(2));
        let stream = connector
            .connect(&request(TargetAddr::Ipv4(Ipv4Addr::LOCALHOST), port))
            .await
            .unwrap();

        let (_accepted, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, stream.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_connect_domain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = Connector::new(Duration::from_secs(2));
        let result = connector
            .connect(&request(TargetAddr::Domain("localhost".into()), port))
            .await;

        // localhost may resolve to ::1 first; only the IPv4 listener exists,
        // so the connector must fall through to 127.0.0.1.
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = Connector::new(Duration::from_secs(2));
        let err = connector
            .connect(&request(TargetAddr::Ipv4(Ipv4Addr::LOCALHOST), port))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Connect { .. }));
        assert!(err.is_connect_failure());
    }

    #[tokio::test]
    async fn test_resolve_failure() {
        let connector = Connector::new(Duration::from_secs(5));
        let err = connector
            .connect(&request(TargetAddr::Domain("does-not-exist.invalid".into()), 80))
            .await
            .unwrap_err();

        assert!(err.is_connect_failure());
    }
}
