//! Static domain overrides.
//!
//! Configured once at startup and consulted before the cache or the tunnel.

use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::dns::parse_address_text;
use crate::error::Error;

/// A single `domain -> address` pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideEntry {
    pub domain: String,
    pub address: Ipv4Addr,
}

impl FromStr for OverrideEntry {
    type Err = Error;

    /// Parse the `domain=address` form used on the command line.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (domain, address) = s
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("override {:?} is not domain=address", s)))?;
        let domain = domain.trim();
        if domain.is_empty() {
            return Err(Error::Config(format!("override {:?} has no domain", s)));
        }
        let address = parse_address_text(address.trim())
            .map_err(|e| Error::Config(format!("override {:?}: {}", s, e)))?;

        Ok(Self {
            domain: domain.to_string(),
            address,
        })
    }
}

/// The override table. Holds at most one entry for the life of the process.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    entry: Option<OverrideEntry>,
}

impl Overrides {
    pub fn new(entry: Option<OverrideEntry>) -> Self {
        Self { entry }
    }

    /// Address pinned for `domain`, if any.
    pub fn lookup(&self, domain: &str) -> Option<Ipv4Addr> {
        self.entry
            .as_ref()
            .filter(|entry| entry.domain == domain)
            .map(|entry| entry.address)
    }

    pub fn len(&self) -> usize {
        usize::from(self.entry.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }
}
