use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use gaedns::cache::DnsCache;
use gaedns::filter::OverrideEntry;
use gaedns::tunnel::{
    DEFAULT_FRONT_END, DEFAULT_LOOKUP_HOST, DEFAULT_LOOKUP_PATH, HttpLookupClient, TunnelConfig,
};
use gaedns::{DnsProxy, ProxyConfig};

#[derive(Parser)]
#[command(name = "gaedns")]
#[command(about = "Local DNS proxy resolving through an HTTP tunnel", long_about = None)]
struct Args {
    /// UDP address to answer DNS queries on (port 0 picks a free port)
    #[arg(short, long, default_value = "127.0.0.1:0")]
    bind: SocketAddr,

    /// TCP address of the reverse lookup server
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    reverse: SocketAddr,

    /// Numeric front-end address lookups are sent to
    #[arg(short, long, default_value = DEFAULT_FRONT_END)]
    front_end: String,

    /// Hostname of the lookup service, sent as the Host header
    #[arg(long, default_value = DEFAULT_LOOKUP_HOST)]
    lookup_host: String,

    /// Path of the lookup endpoint
    #[arg(long, default_value = DEFAULT_LOOKUP_PATH)]
    lookup_path: String,

    /// Pin one domain to an address (domain=address)
    #[arg(short = 'o', long = "override")]
    override_entry: Option<OverrideEntry>,

    /// Directory of the persistent DNS cache
    #[arg(short, long, default_value = "dnscache")]
    cache: PathBuf,

    /// Seconds between statistics lines (0 disables)
    #[arg(long, default_value = "60")]
    stats_interval: u64,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(args: Args) -> Result<()> {
    let config = ProxyConfig {
        bind_addr: args.bind,
        reverse_addr: args.reverse,
        tunnel: TunnelConfig {
            front_end: args.front_end,
            lookup_host: args.lookup_host,
            lookup_path: args.lookup_path,
        },
        override_entry: args.override_entry,
        cache_path: args.cache,
        stats_interval: Duration::from_secs(args.stats_interval),
    };
    config.validate().context("Invalid configuration")?;

    let cache = Arc::new(
        DnsCache::open(&config.cache_path)
            .with_context(|| format!("Failed to open cache at {:?}", config.cache_path))?,
    );
    let client = Arc::new(HttpLookupClient::new().context("Failed to build HTTP client")?);

    let proxy = DnsProxy::bind(config, cache, client)
        .await
        .context("Failed to bind DNS proxy")?;
    info!("DNS port: {}", proxy.local_addr()?.port());

    let shutdown = proxy.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down...");
                shutdown.shutdown();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    proxy.run().await.context("DNS proxy stopped")?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(run(args))
}
