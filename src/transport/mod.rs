//! Transport layer implementations for the DNS proxy.
//!
//! Provides the UDP transport that answers DNS queries and the TCP reverse
//! lookup server that maps addresses back to domains.

pub mod tcp;
pub mod udp;

/// Largest query datagram we accept.
pub const MAX_DNS_PACKET_SIZE: usize = 1024;
