//! TCP reverse lookup server.
//!
//! Lets other components attribute traffic to a domain. The protocol is one
//! exchange per connection: the client sends an IPv4 address followed by a
//! newline, the server replies with the domain most recently resolved to
//! that address (or the literal `null`) and closes the connection.
//! Connections are served one at a time.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::DnsCache;

/// Reply sent when no domain is known for an address.
pub const NOT_FOUND: &str = "null";

/// Default listen port.
pub const DEFAULT_REVERSE_PORT: u16 = 9090;

/// How long a client may take to send its request line.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest request line we read.
const MAX_REQUEST_LEN: u64 = 256;

/// Reverse lookup server.
pub struct ReverseLookupServer {
    listener: TcpListener,
}

impl ReverseLookupServer {
    /// Bind a TCP listener for the server.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Handles each connection to completion before accepting
    /// the next, until `shutdown` fires.
    pub async fn run(self, cache: Arc<DnsCache>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let (client, peer) = tokio::select! {
                result = self.listener.accept() => match result {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Reverse lookup accept error: {}", e);
                        continue;
                    }
                },
                _ = shutdown.changed() => break,
            };

            if let Err(e) = handle_connection(client, &cache).await {
                warn!("Reverse lookup for {} failed: {}", peer, e);
            }
        }

        info!("Reverse lookup server stopped");
    }
}

/// Read one request line, answer it, close.
async fn handle_connection(stream: TcpStream, cache: &DnsCache) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader.take(MAX_REQUEST_LEN));
    let mut line = String::new();

    tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "request line timed out"))??;

    let request = line.trim();
    let domain = match request.parse::<Ipv4Addr>() {
        Ok(address) => cache.reverse_lookup(address),
        Err(_) => None,
    };

    debug!(
        "reverse query: {} {}",
        request,
        domain.as_deref().unwrap_or(NOT_FOUND)
    );

    writer
        .write_all(domain.as_deref().unwrap_or(NOT_FOUND).as_bytes())
        .await?;
    writer.flush().await?;
    writer.shutdown().await?;

    Ok(())
}

/// Ask a reverse lookup server which domain `address` belongs to.
///
/// Returns `None` when the server answered `null`.
pub async fn reverse_query(server: SocketAddr, address: Ipv4Addr) -> io::Result<Option<String>> {
    let mut stream = TcpStream::connect(server).await?;
    stream
        .write_all(format!("{}\n", address).as_bytes())
        .await?;

    let mut reply = String::new();
    stream.read_to_string(&mut reply).await?;

    Ok(match reply.as_str() {
        NOT_FOUND => None,
        _ => Some(reply),
    })
}
