//! UDP transport for DNS queries.
//!
//! One task receives queries and answers everything it can locally. Tunnel
//! lookups are spawned as separate tasks that send their own response when
//! the HTTP round trip completes, so the receive loop never waits on the
//! network.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::resolver::{QueryAction, Resolver};

use super::MAX_DNS_PACKET_SIZE;

/// UDP transport for the DNS proxy.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve queries until `shutdown` fires or the socket fails.
    pub async fn run(
        self,
        resolver: Arc<Resolver>,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        let socket = self.socket;
        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

        loop {
            if *shutdown.borrow() {
                break;
            }

            let (len, src) = tokio::select! {
                result = socket.recv_from(&mut buf) => match result {
                    Ok(r) => r,
                    Err(e) if is_transient(&e) => {
                        warn!("UDP recv error: {}", e);
                        continue;
                    }
                    Err(e) => {
                        error!("UDP socket failed, stopping: {}", e);
                        return Err(e);
                    }
                },
                _ = shutdown.changed() => break,
            };

            let start = Instant::now();
            let query = buf[..len].to_vec();

            match resolver.process_query(&query) {
                QueryAction::Answer {
                    response,
                    domain,
                    outcome,
                } => {
                    send_response(&socket, &response, src).await;
                    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                    debug!("{} {:?} total={:.3}ms", domain, outcome, elapsed_ms);
                    resolver.record(outcome, elapsed_ms);
                }
                QueryAction::Drop { domain, outcome } => {
                    debug!("{} {:?} dropped", domain, outcome);
                    resolver.record(outcome, start.elapsed().as_secs_f64() * 1000.0);
                }
                QueryAction::Tunnel { domain, guard } => {
                    debug!("{} tunneling (from {})", domain, src);
                    let resolver = resolver.clone();
                    let socket = socket.clone();
                    tokio::spawn(async move {
                        if let Some(response) = resolver.resolve_tunneled(&query, guard).await {
                            send_response(&socket, &response, src).await;
                        }
                    });
                }
            }
        }

        info!("UDP transport stopped");
        Ok(())
    }
}

async fn send_response(socket: &UdpSocket, response: &[u8], dst: SocketAddr) {
    if let Err(e) = socket.send_to(response, dst).await {
        error!("UDP response error: {}", e);
    }
}

/// Receive errors that concern a single peer rather than the socket.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}
