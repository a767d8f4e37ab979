//! Query short-circuit rules.
//!
//! Decides which queries are answered without touching the tunnel: pinned
//! overrides, and names the lookup service cannot resolve (reverse zones and
//! syntactically invalid domains), which get a loopback answer instead.

mod overrides;

use std::net::Ipv4Addr;

pub use overrides::{OverrideEntry, Overrides};

/// Answer given to names that are never tunneled.
pub const LOOPBACK_ANSWER: Ipv4Addr = Ipv4Addr::LOCALHOST;

const REVERSE_ZONES: [&str; 2] = ["in-addr.arpa", "ip6.arpa"];

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Whether `domain` must be answered locally with [`LOOPBACK_ANSWER`].
pub fn needs_loopback(domain: &str) -> bool {
    is_reverse_zone(domain) || !is_valid_domain(domain)
}

/// Reverse lookup names (`*.in-addr.arpa`, `*.ip6.arpa`).
pub fn is_reverse_zone(domain: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    REVERSE_ZONES.iter().any(|zone| domain.ends_with(zone))
}

/// Check that `domain` is a plausible public hostname.
///
/// Requires at least two labels of letters, digits and inner hyphens, and a
/// top-level label that starts with a letter.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return false;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }

    let labels_ok = labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    });

    let tld_ok = labels
        .last()
        .and_then(|tld| tld.bytes().next())
        .is_some_and(|b| b.is_ascii_alphabetic());

    labels_ok && tld_ok
}
