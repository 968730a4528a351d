//! SOCKS5 handshake negotiation (RFC 1928, CONNECT with no authentication).
//!
//! The negotiator owns the client stream while the handshake runs and walks
//! through `AwaitGreeting → AwaitRequest → Connected`, or drops to `Closed`
//! on any failure. Every read and write is bounded by the per-step timeout.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result, Stage};
use crate::proxy::linger_close;

/// SOCKS protocol version 5.
pub const SOCKS_VERSION: u8 = 0x05;
/// "No authentication required" method.
pub const METHOD_NO_AUTH: u8 = 0x00;
/// CONNECT command.
pub const CMD_CONNECT: u8 = 0x01;
/// IPv4 address type.
pub const ATYP_IPV4: u8 = 0x01;
/// Domain name address type.
pub const ATYP_DOMAIN: u8 = 0x03;
/// Reply code: succeeded.
pub const REP_SUCCEEDED: u8 = 0x00;
/// Reply code: general SOCKS server failure.
pub const REP_GENERAL_FAILURE: u8 = 0x01;

/// Method selection reply: version 5, no authentication.
pub const METHOD_SELECTION: [u8; 2] = [SOCKS_VERSION, METHOD_NO_AUTH];

/// Success reply with a zeroed IPv4 bind address.
pub const SUCCESS_REPLY: [u8; 10] = reply(REP_SUCCEEDED);

/// Generic failure reply with a zeroed IPv4 bind address.
pub const FAILURE_REPLY: [u8; 10] = reply(REP_GENERAL_FAILURE);

const fn reply(status: u8) -> [u8; 10] {
    [SOCKS_VERSION, status, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

/// Destination host requested by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// Literal IPv4 address
    Ipv4(Ipv4Addr),
    /// Domain name, resolved at connect time
    Domain(String),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip) => write!(f, "{}", ip),
            TargetAddr::Domain(name) => f.write_str(name),
        }
    }
}

/// Parsed SOCKS5 CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    /// Protocol version byte, always 5
    pub version: u8,
    /// Command byte, always CONNECT
    pub command: u8,
    /// Address type byte as sent
    pub address_type: u8,
    /// Destination host
    pub target: TargetAddr,
    /// Destination port
    pub port: u16,
}

impl SocksRequest {
    /// `host:port` form used for logging and error reports.
    pub fn destination(&self) -> String {
        format!("{}:{}", self.target, self.port)
    }
}

/// Handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorState {
    /// Waiting for the method negotiation message
    AwaitGreeting,
    /// Waiting for the CONNECT request
    AwaitRequest,
    /// Success reply sent; stream ready for relaying
    Connected,
    /// Handshake aborted
    Closed,
}

/// Drives the server side of a SOCKS5 handshake over `S`.
pub struct Negotiator<S> {
    stream: S,
    state: NegotiatorState,
    step_timeout: Duration,
}

impl<S> Negotiator<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a negotiator for a freshly sniffed client stream.
    pub fn new(stream: S, step_timeout: Duration) -> Self {
        Self {
            stream,
            state: NegotiatorState::AwaitGreeting,
            step_timeout,
        }
    }

    /// Current handshake state.
    pub fn state(&self) -> NegotiatorState {
        self.state
    }

    /// Give back the client stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Read the method negotiation and select "no authentication".
    ///
    /// Offered methods are read and discarded. A version other than 5
    /// closes the handshake without a reply.
    pub async fn greet(&mut self) -> Result<()> {
        self.expect_state(NegotiatorState::AwaitGreeting)?;

        let result = self.read_greeting().await;
        self.state = match result {
            Ok(()) => NegotiatorState::AwaitRequest,
            Err(_) => NegotiatorState::Closed,
        };
        result
    }

    async fn read_greeting(&mut self) -> Result<()> {
        let mut header = [0u8; 2];
        self.read_exact(&mut header).await?;

        if header[0] != SOCKS_VERSION {
            return Err(Error::VersionMismatch {
                expected: SOCKS_VERSION,
                actual: header[0],
            });
        }

        let mut methods = [0u8; 255];
        let n_methods = header[1] as usize;
        self.read_exact(&mut methods[..n_methods]).await?;

        self.write_all(&METHOD_SELECTION).await
    }

    /// Read and validate the CONNECT request.
    ///
    /// On error the state stays `AwaitRequest`; the caller is expected to
    /// answer with [`Negotiator::reply_failure`].
    pub async fn read_request(&mut self) -> Result<SocksRequest> {
        self.expect_state(NegotiatorState::AwaitRequest)?;

        let mut header = [0u8; 4];
        self.read_exact(&mut header).await?;
        let [version, command, _reserved, address_type] = header;

        if version != SOCKS_VERSION {
            return Err(Error::VersionMismatch {
                expected: SOCKS_VERSION,
                actual: version,
            });
        }
        if command != CMD_CONNECT {
            return Err(Error::UnsupportedCommand(command));
        }

        let target = match address_type {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                self.read_exact(&mut octets).await?;
                TargetAddr::Ipv4(Ipv4Addr::from(octets))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                self.read_exact(&mut len).await?;
                if len[0] == 0 {
                    return Err(Error::invalid("empty domain name"));
                }
                let mut name = vec![0u8; len[0] as usize];
                self.read_exact(&mut name).await?;
                let name = String::from_utf8(name)
                    .map_err(|_| Error::invalid("domain name is not valid UTF-8"))?;
                TargetAddr::Domain(name)
            }
            other => return Err(Error::UnsupportedAddressType(other)),
        };

        let mut port = [0u8; 2];
        self.read_exact(&mut port).await?;

        Ok(SocksRequest {
            version,
            command,
            address_type,
            target,
            port: u16::from_be_bytes(port),
        })
    }

    /// Send the success reply and hand the stream over to the relay.
    pub async fn reply_success(&mut self) -> Result<()> {
        self.expect_state(NegotiatorState::AwaitRequest)?;

        match self.write_all(&SUCCESS_REPLY).await {
            Ok(()) => {
                self.state = NegotiatorState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = NegotiatorState::Closed;
                Err(e)
            }
        }
    }

    /// Send the generic failure reply, best-effort, and close.
    pub async fn reply_failure(&mut self) {
        if self.state == NegotiatorState::AwaitRequest {
            match self.write_all(&FAILURE_REPLY).await {
                Ok(()) => linger_close(&mut self.stream, self.step_timeout).await,
                Err(e) => tracing::trace!("Failure reply not delivered: {}", e),
            }
        }
        self.state = NegotiatorState::Closed;
    }

    fn expect_state(&self, expected: NegotiatorState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::invalid(format!(
                "handshake step out of order: in {:?}, expected {:?}",
                self.state, expected
            )))
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match tokio::time::timeout(self.step_timeout, self.stream.read_exact(buf)).await {
            Ok(result) => result.map(|_| ()).map_err(Error::Network),
            Err(_) => Err(Error::timeout(Stage::Handshake, self.step_timeout)),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match tokio::time::timeout(self.step_timeout, self.stream.write_all(buf)).await {
            Ok(result) => result.map_err(Error::Network),
            Err(_) => Err(Error::timeout(Stage::Handshake, self.step_timeout)),
        }
    }
}
