//! gaedns - a local DNS proxy that resolves through an HTTP tunnel.
//!
//! Queries are answered from a static override, a persistent cache, or a
//! lookup service reached over HTTP through a fronting address. A TCP
//! reverse lookup server maps addresses back to the domains they were
//! resolved for.

pub mod cache;
pub mod dns;
pub mod error;
pub mod filter;
pub mod inflight;
pub mod proxy;
pub mod resolver;
pub mod stats;
pub mod transport;
pub mod tunnel;

pub use error::{Error, Result};
pub use proxy::{DnsProxy, ProxyConfig, ShutdownHandle};
