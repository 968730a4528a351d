//! Gateway configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable naming the listen port.
pub const PORT_ENV: &str = "PORT";

/// Environment variable naming the listen address.
pub const LISTEN_ADDR_ENV: &str = "LISTEN_ADDR";

/// Port used when `PORT` is unset or unparsable.
pub const DEFAULT_PORT: u16 = 8080;

/// Gateway configuration.
///
/// Read-only once the server is bound; shared with every dispatch task.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address
    pub listen_addr: String,
    /// Listen port
    pub listen_port: u16,
    /// Bound on waiting for the first bytes of a connection
    pub sniff_timeout: Duration,
    /// Bound on each SOCKS5 handshake read or write
    pub handshake_timeout: Duration,
    /// Bound on resolving and connecting to a destination
    pub connect_timeout: Duration,
    /// Relay inactivity window
    pub idle_timeout: Duration,
    /// Bound on reading the HTTP request line
    pub http_read_timeout: Duration,
    /// Maximum bytes read for the HTTP request line
    pub http_max_request_line: usize,
    /// Per-direction relay buffer size
    pub relay_buffer_size: usize,
    /// How long shutdown waits for in-flight connections
    pub drain_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".into(),
            listen_port: DEFAULT_PORT,
            sniff_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            http_read_timeout: Duration::from_secs(5),
            http_max_request_line: 1024,
            relay_buffer_size: 4096,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl GatewayConfig {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `PORT` and `LISTEN_ADDR` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var(PORT_ENV).ok().as_deref(),
            std::env::var(LISTEN_ADDR_ENV).ok().as_deref(),
        );
    }

    fn apply_overrides(&mut self, port: Option<&str>, addr: Option<&str>) {
        if let Some(port) = port {
            match port.trim().parse::<u16>() {
                Ok(port) => self.listen_port = port,
                Err(_) => tracing::warn!(
                    "Ignoring invalid {}={:?}, using {}",
                    PORT_ENV,
                    port,
                    self.listen_port
                ),
            }
        }
        if let Some(addr) = addr.map(str::trim).filter(|a| !a.is_empty()) {
            self.listen_addr = addr.to_string();
        }
    }

    /// Address string passed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::config("listen_addr cannot be empty"));
        }
        let timeouts = [
            ("sniff_timeout", self.sniff_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("connect_timeout", self.connect_timeout),
            ("idle_timeout", self.idle_timeout),
            ("http_read_timeout", self.http_read_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(Error::config(format!("{} must be non-zero", name)));
            }
        }
        if self.http_max_request_line < 16 {
            return Err(Error::config("http_max_request_line must be at least 16"));
        }
        if !(512..=1 << 20).contains(&self.relay_buffer_size) {
            return Err(Error::config(
                "relay_buffer_size must be between 512 and 1048576",
            ));
        }
        Ok(())
    }
}

/// Configuration file format for serialization.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfigFile {
    /// Listen address
    pub listen_addr: String,
    /// Listen port
    pub listen_port: u16,
    /// Sniff timeout (seconds)
    pub sniff_timeout_secs: u64,
    /// Handshake step timeout (seconds)
    pub handshake_timeout_secs: u64,
    /// Connect timeout (seconds)
    pub connect_timeout_secs: u64,
    /// Relay idle timeout (seconds)
    pub idle_timeout_secs: u64,
    /// HTTP request line timeout (seconds)
    pub http_read_timeout_secs: u64,
    /// HTTP request line limit (bytes)
    pub http_max_request_line: usize,
    /// Relay buffer size (bytes)
    pub relay_buffer_size: usize,
    /// Shutdown drain timeout (seconds)
    pub drain_timeout_secs: u64,
}

impl Default for GatewayConfigFile {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

impl GatewayConfigFile {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(e.to_string()))
    }

    /// Render as pretty TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }

    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<GatewayConfig> {
        let config = GatewayConfig {
            listen_addr: self.listen_addr.clone(),
            listen_port: self.listen_port,
            sniff_timeout: Duration::from_secs(self.sniff_timeout_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            http_read_timeout: Duration::from_secs(self.http_read_timeout_secs),
            http_max_request_line: self.http_max_request_line,
            relay_buffer_size: self.relay_buffer_size,
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
        };
        config.validate()?;
        Ok(config)
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            listen_addr: config.listen_addr.clone(),
            listen_port: config.listen_port,
            sniff_timeout_secs: config.sniff_timeout.as_secs(),
            handshake_timeout_secs: config.handshake_timeout.as_secs(),
            connect_timeout_secs: config.connect_timeout.as_secs(),
            idle_timeout_secs: config.idle_timeout.as_secs(),
            http_read_timeout_secs: config.http_read_timeout.as_secs(),
            http_max_request_line: config.http_max_request_line,
            relay_buffer_size: config.relay_buffer_size,
            drain_timeout_secs: config.drain_timeout.as_secs(),
        }
    }
}
