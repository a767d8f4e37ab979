//! DNS query resolution logic.
//!
//! Handles the core query processing pipeline:
//! 1. Override table
//! 2. Persistent cache
//! 3. In-flight dedup, then loopback for untunnelable names or a tunnel lookup
//!
//! Transports handle the actual I/O, resolver handles decisions.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error};

use crate::cache::DnsCache;
use crate::dns::{build_response, extract_question_domain};
use crate::filter::{LOOPBACK_ANSWER, Overrides, needs_loopback};
use crate::inflight::{InFlight, InFlightGuard};
use crate::stats::{Outcome, Stats, StatsSnapshot};
use crate::tunnel::Tunnel;

/// Action to take for a DNS query.
pub enum QueryAction {
    /// Send this response immediately.
    Answer {
        response: Vec<u8>,
        domain: String,
        outcome: Outcome,
    },
    /// Resolve through the tunnel. The guard holds the domain's in-flight
    /// claim and must live until the lookup completes.
    Tunnel { domain: String, guard: InFlightGuard },
    /// Send nothing.
    Drop { domain: String, outcome: Outcome },
}

/// Resolver handles DNS query processing decisions.
///
/// Shared by the UDP loop and every tunnel completion.
pub struct Resolver {
    overrides: Overrides,
    cache: Arc<DnsCache>,
    inflight: InFlight,
    tunnel: Tunnel,
    stats: Stats,
}

impl Resolver {
    pub fn new(overrides: Overrides, cache: Arc<DnsCache>, tunnel: Tunnel) -> Self {
        Self {
            overrides,
            cache,
            inflight: InFlight::new(),
            tunnel,
            stats: Stats::new(),
        }
    }

    /// Process a DNS query and decide what action to take.
    pub fn process_query(&self, query: &[u8]) -> QueryAction {
        let domain = extract_question_domain(query);
        if domain.is_empty() {
            return QueryAction::Drop {
                domain,
                outcome: Outcome::Malformed,
            };
        }

        // Step 1: Override table, written through so reverse lookups see it
        if let Some(address) = self.overrides.lookup(&domain) {
            debug!("Override hit: {} -> {}", domain, address);
            self.cache.put(&domain, address);
            return QueryAction::Answer {
                response: build_response(query, address),
                domain,
                outcome: Outcome::Overridden,
            };
        }

        // Step 2: Persistent cache
        if let Some(record) = self.cache.get(&domain) {
            debug!("DNS cache hit: {} -> {}", domain, record.address);
            self.cache.touch(&record);
            return QueryAction::Answer {
                response: build_response(query, record.address),
                domain,
                outcome: Outcome::Cached,
            };
        }

        // Step 3: One resolution per domain at a time
        let Some(guard) = self.inflight.try_begin(&domain) else {
            debug!("Already resolving {}, dropping duplicate query", domain);
            return QueryAction::Drop {
                domain,
                outcome: Outcome::Duplicate,
            };
        };

        if needs_loopback(&domain) {
            debug!("Answering {} with {}", domain, LOOPBACK_ANSWER);
            self.cache.put(&domain, LOOPBACK_ANSWER);
            drop(guard);
            return QueryAction::Answer {
                response: build_response(query, LOOPBACK_ANSWER),
                domain,
                outcome: Outcome::Loopback,
            };
        }

        QueryAction::Tunnel { domain, guard }
    }

    /// Run the tunnel lookup for a query handed out as [`QueryAction::Tunnel`].
    ///
    /// Returns the response to send, or `None` when the lookup failed. The
    /// in-flight claim is released when this returns, whatever the outcome.
    pub async fn resolve_tunneled(&self, query: &[u8], guard: InFlightGuard) -> Option<Vec<u8>> {
        let start = Instant::now();
        let domain = guard.domain().to_string();

        let answer = match self.tunnel.resolve(&domain).await {
            Ok(address) => self.answer_resolved(query, &domain, address),
            Err(e) => {
                error!("Failed to resolve {}: {}", domain, e);
                None
            }
        };
        drop(guard);

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        match &answer {
            Some(_) => self.stats.record(Outcome::Resolved, elapsed_ms),
            None => self.stats.record(Outcome::Failed, elapsed_ms),
        }
        if answer.is_some() {
            debug!("Resolved {} in {:.3}ms", domain, elapsed_ms);
        }
        answer
    }

    fn answer_resolved(&self, query: &[u8], domain: &str, address: Ipv4Addr) -> Option<Vec<u8>> {
        let response = build_response(query, address);
        if response.is_empty() {
            error!("Built an empty response for {}", domain);
            return None;
        }
        self.cache.put(domain, address);
        debug!("Success to resolve {} -> {}", domain, address);
        Some(response)
    }

    /// Record a query that was finished by [`process_query`](Self::process_query).
    pub fn record(&self, outcome: Outcome, elapsed_ms: f64) {
        self.stats.record(outcome, elapsed_ms);
    }

    pub fn stats_snapshot_and_reset(&self) -> StatsSnapshot {
        self.stats.snapshot_and_reset()
    }

    pub fn cache(&self) -> &Arc<DnsCache> {
        &self.cache
    }

    pub fn inflight(&self) -> &InFlight {
        &self.inflight
    }

    /// Number of domains pinned by the override table.
    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{answer_address, query_packet};
    use crate::error::{Error, Result};
    use crate::filter::OverrideEntry;
    use crate::tunnel::{LookupClient, TunnelConfig};
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient {
        body: &'static str,
        calls: AtomicUsize,
    }

    impl LookupClient for CountingClient {
        fn get<'a>(&'a self, _url: &'a str, _host: &'a str) -> BoxFuture<'a, Result<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = self.body.to_string();
            async move { Ok(body) }.boxed()
        }
    }

    struct FailingClient;

    impl LookupClient for FailingClient {
        fn get<'a>(&'a self, _url: &'a str, _host: &'a str) -> BoxFuture<'a, Result<String>> {
            async { Err(Error::TunnelRejected("timed out".into())) }.boxed()
        }
    }

    fn resolver_with(
        client: Arc<dyn LookupClient>,
        entry: Option<OverrideEntry>,
    ) -> Resolver {
        let cache = Arc::new(DnsCache::temporary().unwrap());
        let tunnel = Tunnel::new(client, TunnelConfig::default());
        Resolver::new(Overrides::new(entry), cache, tunnel)
    }

    fn counting(body: &'static str) -> Arc<CountingClient> {
        Arc::new(CountingClient {
            body,
            calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn malformed_query_is_dropped() {
        let resolver = resolver_with(counting("1.2.3.4"), None);

        assert!(matches!(
            resolver.process_query(&[0u8; 8]),
            QueryAction::Drop {
                outcome: Outcome::Malformed,
                ..
            }
        ));
        assert!(resolver.inflight().is_empty());
    }

    #[test]
    fn override_wins_and_writes_through() {
        let entry = OverrideEntry {
            domain: "example.com".into(),
            address: Ipv4Addr::new(10, 9, 8, 7),
        };
        let resolver = resolver_with(counting("1.2.3.4"), Some(entry));
        resolver
            .cache()
            .put("example.com", Ipv4Addr::new(1, 1, 1, 1));

        let QueryAction::Answer {
            response, outcome, ..
        } = resolver.process_query(&query_packet(1, "example.com"))
        else {
            panic!("expected an answer");
        };

        assert_eq!(outcome, Outcome::Overridden);
        assert_eq!(answer_address(&response), Some(Ipv4Addr::new(10, 9, 8, 7)));
        assert_eq!(
            resolver.cache().get("example.com").unwrap().address,
            Ipv4Addr::new(10, 9, 8, 7)
        );
    }

    #[test]
    fn cache_hit_answers_and_refreshes() {
        let resolver = resolver_with(counting("1.2.3.4"), None);
        let stale = crate::cache::CachedRecord {
            domain: "example.com".into(),
            address: Ipv4Addr::new(5, 6, 7, 8),
            timestamp: 1,
        };
        resolver.cache().store(&stale);

        let QueryAction::Answer {
            response, outcome, ..
        } = resolver.process_query(&query_packet(2, "example.com"))
        else {
            panic!("expected an answer");
        };

        assert_eq!(outcome, Outcome::Cached);
        assert_eq!(answer_address(&response), Some(Ipv4Addr::new(5, 6, 7, 8)));
        assert!(resolver.cache().get("example.com").unwrap().timestamp > 1);
    }

    #[test]
    fn reverse_zone_gets_loopback_without_tunnel() {
        let client = counting("1.2.3.4");
        let resolver = resolver_with(client.clone(), None);

        let QueryAction::Answer {
            response, outcome, ..
        } = resolver.process_query(&query_packet(3, "10.0.0.1.in-addr.arpa"))
        else {
            panic!("expected an answer");
        };

        assert_eq!(outcome, Outcome::Loopback);
        assert_eq!(answer_address(&response), Some(Ipv4Addr::LOCALHOST));
        assert!(resolver.inflight().is_empty());
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            resolver.cache().get("10.0.0.1.in-addr.arpa").unwrap().address,
            Ipv4Addr::LOCALHOST
        );
    }

    #[test]
    fn duplicate_query_is_dropped_while_in_flight() {
        let resolver = resolver_with(counting("1.2.3.4"), None);
        let query = query_packet(4, "example.com");

        let first = resolver.process_query(&query);
        assert!(matches!(first, QueryAction::Tunnel { .. }));
        assert!(matches!(
            resolver.process_query(&query),
            QueryAction::Drop {
                outcome: Outcome::Duplicate,
                ..
            }
        ));

        drop(first);
        assert!(matches!(
            resolver.process_query(&query),
            QueryAction::Tunnel { .. }
        ));
    }

    #[tokio::test]
    async fn tunnel_success_caches_and_answers() {
        let client = counting("93.184.216.34\n");
        let resolver = resolver_with(client.clone(), None);
        let query = query_packet(5, "example.com");

        let QueryAction::Tunnel { guard, .. } = resolver.process_query(&query) else {
            panic!("expected a tunnel lookup");
        };
        let response = resolver.resolve_tunneled(&query, guard).await.unwrap();

        assert_eq!(
            answer_address(&response),
            Some(Ipv4Addr::new(93, 184, 216, 34))
        );
        assert_eq!(
            resolver.cache().get("example.com").unwrap().address,
            Ipv4Addr::new(93, 184, 216, 34)
        );
        assert!(resolver.inflight().is_empty());
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.stats_snapshot_and_reset().resolved, 1);
    }

    #[tokio::test]
    async fn tunnel_sentinel_sends_nothing() {
        let resolver = resolver_with(counting("Error"), None);
        let query = query_packet(6, "nxdomain.example");

        let QueryAction::Tunnel { guard, .. } = resolver.process_query(&query) else {
            panic!("expected a tunnel lookup");
        };

        assert!(resolver.resolve_tunneled(&query, guard).await.is_none());
        assert!(resolver.cache().get("nxdomain.example").is_none());
        assert!(resolver.inflight().is_empty());
    }

    #[tokio::test]
    async fn tunnel_failure_releases_domain() {
        let resolver = resolver_with(Arc::new(FailingClient), None);
        let query = query_packet(7, "example.com");

        let QueryAction::Tunnel { guard, .. } = resolver.process_query(&query) else {
            panic!("expected a tunnel lookup");
        };

        assert!(resolver.resolve_tunneled(&query, guard).await.is_none());
        assert!(resolver.inflight().is_empty());
        assert_eq!(resolver.stats_snapshot_and_reset().failed, 1);
    }

    #[tokio::test]
    async fn tunnel_bad_address_sends_nothing() {
        let resolver = resolver_with(counting("0.1.2.3"), None);
        let query = query_packet(8, "example.com");

        let QueryAction::Tunnel { guard, .. } = resolver.process_query(&query) else {
            panic!("expected a tunnel lookup");
        };

        assert!(resolver.resolve_tunneled(&query, guard).await.is_none());
        assert!(resolver.cache().is_empty());
    }
}
