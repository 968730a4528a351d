//! # portmux
//!
//! A single-port TCP gateway that serves two unrelated protocols from one
//! listening socket: an HTTP liveness endpoint for platform health checks
//! and a SOCKS5 CONNECT proxy.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Listener / Acceptor                     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Dispatcher (one task per connection, owns the socket)  │
//! ├─────────────────────────────────────────────────────────┤
//! │  Protocol Sniffer (peek first bytes, nothing consumed)  │
//! ├───────────────────────────┬─────────────────────────────┤
//! │  HTTP liveness (/health)  │  SOCKS5 Negotiator          │
//! │                           │  → Destination Connector    │
//! │                           │  → Timeout-bounded Relay    │
//! └───────────────────────────┴─────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **Isolation**: a slow or failing peer only ever affects its own task
//! 2. **Bounded waits**: every read, write and connect has a timeout
//! 3. **Clean teardown**: client and destination sockets close together

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod proxy;

#[cfg(feature = "server")]
pub mod server;

pub use error::{Error, Result, Stage};

/// Crate version, reported at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
