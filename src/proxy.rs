//! DNS proxy orchestration.
//!
//! Binds transports, wires the shared collaborators together and runs the
//! proxy until shutdown.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::cache::DnsCache;
use crate::error::{Error, Result};
use crate::filter::{OverrideEntry, Overrides};
use crate::resolver::Resolver;
use crate::transport::tcp::{DEFAULT_REVERSE_PORT, ReverseLookupServer};
use crate::transport::udp::UdpTransport;
use crate::tunnel::{LookupClient, Tunnel, TunnelConfig};

/// Configuration for the DNS proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local UDP address to answer queries on. Port 0 picks a free port.
    pub bind_addr: SocketAddr,
    /// Local TCP address of the reverse lookup server.
    pub reverse_addr: SocketAddr,
    /// Lookup service addressing (front-end address, logical host, path).
    pub tunnel: TunnelConfig,
    /// Optional pinned `domain -> address`.
    pub override_entry: Option<OverrideEntry>,
    /// Directory of the persistent cache.
    pub cache_path: PathBuf,
    /// How often to log statistics. Zero disables.
    pub stats_interval: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0).into(),
            reverse_addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_REVERSE_PORT).into(),
            tunnel: TunnelConfig::default(),
            override_entry: None,
            cache_path: PathBuf::from("dnscache"),
            stats_interval: Duration::from_secs(60),
        }
    }
}

impl ProxyConfig {
    /// Reject settings that cannot work before anything is bound.
    pub fn validate(&self) -> Result<()> {
        if self.tunnel.front_end.parse::<std::net::IpAddr>().is_err() {
            return Err(Error::Config(format!(
                "front-end {:?} is not a numeric address",
                self.tunnel.front_end
            )));
        }
        if self.tunnel.lookup_host.is_empty() {
            return Err(Error::Config("lookup host is empty".into()));
        }
        if !self.tunnel.lookup_path.starts_with('/') {
            return Err(Error::Config(format!(
                "lookup path {:?} must start with '/'",
                self.tunnel.lookup_path
            )));
        }
        Ok(())
    }
}

/// Stops a running proxy.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// The DNS proxy service.
///
/// Owns the override table, in-flight set and cache handle; both servers
/// receive them from here.
pub struct DnsProxy {
    udp: UdpTransport,
    reverse: ReverseLookupServer,
    resolver: Arc<Resolver>,
    stats_interval: Duration,
    shutdown_tx: Arc<watch::Sender<bool>>,
    closed: Arc<AtomicBool>,
}

impl DnsProxy {
    /// Validate `config` and bind both sockets.
    pub async fn bind(
        config: ProxyConfig,
        cache: Arc<DnsCache>,
        client: Arc<dyn LookupClient>,
    ) -> Result<Self> {
        config.validate()?;

        let udp = UdpTransport::bind(config.bind_addr).await?;
        let reverse = ReverseLookupServer::bind(config.reverse_addr).await?;

        let tunnel = Tunnel::new(client, config.tunnel);
        let resolver = Arc::new(Resolver::new(
            Overrides::new(config.override_entry),
            cache,
            tunnel,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            udp,
            reverse,
            resolver,
            stats_interval: config.stats_interval,
            shutdown_tx: Arc::new(shutdown_tx),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Address the UDP transport is answering on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp.local_addr()?)
    }

    /// Address of the reverse lookup server.
    pub fn reverse_addr(&self) -> Result<SocketAddr> {
        Ok(self.reverse.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Flag that turns true once the UDP loop has ended.
    ///
    /// [`run`](Self::run) consumes the proxy, so take the flag beforehand to
    /// observe it closing.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// Run the proxy.
    ///
    /// Prunes expired cache records, starts the reverse lookup server and
    /// the stats logger, then serves UDP queries until shutdown or a fatal
    /// socket error. The reverse server is stopped on the way out.
    pub async fn run(self) -> Result<()> {
        let cache = self.resolver.cache().clone();
        let pruned = cache.prune_expired();

        info!(
            "DNS proxy listening on {} ({} cached, {} expired, {} overrides)",
            self.udp.local_addr()?,
            cache.len(),
            pruned,
            self.resolver.override_count()
        );
        info!("Reverse lookup on {}", self.reverse.local_addr()?);

        let reverse = tokio::spawn(
            self.reverse
                .run(cache.clone(), self.shutdown_tx.subscribe()),
        );

        if !self.stats_interval.is_zero() {
            tokio::spawn(log_stats(
                self.resolver.clone(),
                self.stats_interval,
                self.shutdown_tx.subscribe(),
            ));
        }

        let result = self
            .udp
            .run(self.resolver.clone(), self.shutdown_tx.subscribe())
            .await;

        self.closed.store(true, Ordering::Release);
        self.shutdown_tx.send_replace(true);
        if let Err(e) = reverse.await {
            error!("Reverse lookup server task failed: {}", e);
        }
        cache.flush();
        info!("DNS proxy closed");

        Ok(result?)
    }
}

/// Log a stats line every `interval` until shutdown.
async fn log_stats(resolver: Arc<Resolver>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // Skip first immediate tick
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let stats = resolver.stats_snapshot_and_reset();
        info!(
            "[stats] uptime={}s cache={} inflight={} requests={} overridden={} cached={} loopback={} resolved={} failed={} duplicates={} malformed={} avg_response={:.2}ms",
            stats.uptime_secs,
            resolver.cache().len(),
            resolver.inflight().len(),
            stats.requests,
            stats.overridden,
            stats.cached,
            stats.loopback,
            stats.resolved,
            stats.failed,
            stats.duplicates,
            stats.malformed,
            stats.avg_response_ms
        );
    }
}
