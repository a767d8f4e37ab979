//! HTTP tunnel to the remote lookup service.
//!
//! A lookup is a plain `GET <path>?host=<name>` where the name is base64
//! encoded twice. The request is sent to a numeric front-end address while
//! the `Host` header still names the lookup service, so routing at the front
//! end reaches the right backend. The body is either a dotted quad or the
//! literal `Error`.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::header::HOST;

use crate::dns::parse_address_text;
use crate::error::{Error, Result};

/// Fixed per-request timeout.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(6);

/// Body returned by the lookup service when it cannot resolve a name.
pub const ERROR_SENTINEL: &str = "Error";

pub const DEFAULT_FRONT_END: &str = "203.208.46.1";
pub const DEFAULT_LOOKUP_HOST: &str = "myhosts.sinaapp.com";
pub const DEFAULT_LOOKUP_PATH: &str = "/lookup.php";

/// HTTP GET with an explicit `Host` header.
///
/// Implementations must enforce [`LOOKUP_TIMEOUT`] themselves and report a
/// timeout as an error.
pub trait LookupClient: Send + Sync {
    fn get<'a>(&'a self, url: &'a str, host: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// [`LookupClient`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpLookupClient {
    client: reqwest::Client,
}

impl HttpLookupClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()?;

        Ok(Self { client })
    }
}

impl LookupClient for HttpLookupClient {
    fn get<'a>(&'a self, url: &'a str, host: &'a str) -> BoxFuture<'a, Result<String>> {
        async move {
            let response = self
                .client
                .get(url)
                .header(HOST, host)
                .send()
                .await?
                .error_for_status()?;

            Ok(response.text().await?)
        }
        .boxed()
    }
}

/// Where and how lookups are addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Numeric address the request is actually sent to.
    pub front_end: String,
    /// Logical hostname of the lookup service, sent as `Host`.
    pub lookup_host: String,
    pub lookup_path: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            front_end: DEFAULT_FRONT_END.to_string(),
            lookup_host: DEFAULT_LOOKUP_HOST.to_string(),
            lookup_path: DEFAULT_LOOKUP_PATH.to_string(),
        }
    }
}

/// Resolves domains through the lookup service.
#[derive(Clone)]
pub struct Tunnel {
    client: Arc<dyn LookupClient>,
    config: TunnelConfig,
}

impl Tunnel {
    pub fn new(client: Arc<dyn LookupClient>, config: TunnelConfig) -> Self {
        Self { client, config }
    }

    /// Lookup URL for `domain`, already rewritten to the front-end address.
    pub fn lookup_url(&self, domain: &str) -> String {
        let logical = format!(
            "http://{}{}?host={}",
            self.config.lookup_host,
            self.config.lookup_path,
            encode_domain(domain)
        );
        logical.replacen(&self.config.lookup_host, &self.config.front_end, 1)
    }

    /// Ask the lookup service for the address of `domain`.
    pub async fn resolve(&self, domain: &str) -> Result<Ipv4Addr> {
        let url = self.lookup_url(domain);
        let body = self.client.get(&url, &self.config.lookup_host).await?;
        interpret_body(domain, &body)
    }
}

/// Encode a domain for the `host` query parameter.
pub fn encode_domain(domain: &str) -> String {
    STANDARD.encode(STANDARD.encode(domain.as_bytes()))
}

/// Turn a lookup response body into an address.
pub fn interpret_body(domain: &str, body: &str) -> Result<Ipv4Addr> {
    let body = body.trim();
    if body.is_empty() || body == ERROR_SENTINEL {
        return Err(Error::TunnelRejected(domain.to_string()));
    }
    parse_address_text(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Records every request and answers with a canned body.
    struct CannedClient {
        body: Option<String>,
        requests: Mutex<Vec<(String, String)>>,
    }

    impl LookupClient for CannedClient {
        fn get<'a>(&'a self, url: &'a str, host: &'a str) -> BoxFuture<'a, Result<String>> {
            self.requests
                .lock()
                .unwrap()
                .push((url.to_string(), host.to_string()));
            let body = self.body.clone();
            async move { body.ok_or_else(|| Error::TunnelRejected("unreachable".into())) }.boxed()
        }
    }

    fn tunnel_with(body: Option<&str>) -> (Tunnel, Arc<CannedClient>) {
        let client = Arc::new(CannedClient {
            body: body.map(str::to_string),
            requests: Mutex::new(Vec::new()),
        });
        (Tunnel::new(client.clone(), TunnelConfig::default()), client)
    }

    #[test]
    fn encode_domain_is_double_base64() {
        // base64("example.com") = "ZXhhbXBsZS5jb20="
        assert_eq!(encode_domain("example.com"), "WlhoaGJYQnNaUzVqYjIwPQ==");
    }

    #[test]
    fn lookup_url_targets_front_end() {
        let (tunnel, _) = tunnel_with(None);

        assert_eq!(
            tunnel.lookup_url("example.com"),
            "http://203.208.46.1/lookup.php?host=WlhoaGJYQnNaUzVqYjIwPQ=="
        );
    }

    #[test]
    fn interpret_body_trims_and_parses() {
        assert_eq!(
            interpret_body("example.com", " 93.184.216.34\r\n").unwrap(),
            Ipv4Addr::new(93, 184, 216, 34)
        );
    }

    #[test]
    fn interpret_body_rejects_sentinel_and_empty() {
        assert!(matches!(
            interpret_body("example.com", "Error\n"),
            Err(Error::TunnelRejected(_))
        ));
        assert!(matches!(
            interpret_body("example.com", "   "),
            Err(Error::TunnelRejected(_))
        ));
        assert!(matches!(
            interpret_body("example.com", "<html>"),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn resolve_sends_fronted_request() {
        let (tunnel, client) = tunnel_with(Some("93.184.216.34"));

        let address = tunnel.resolve("example.com").await.unwrap();

        assert_eq!(address, Ipv4Addr::new(93, 184, 216, 34));
        let requests = client.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].0.starts_with("http://203.208.46.1/lookup.php?host="));
        assert_eq!(requests[0].1, "myhosts.sinaapp.com");
    }

    #[tokio::test]
    async fn resolve_surfaces_client_failure() {
        let (tunnel, _) = tunnel_with(None);

        assert!(tunnel.resolve("example.com").await.is_err());
    }

    async fn read_request_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut buf = [0u8; 512];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }
        String::from_utf8(head).unwrap()
    }

    fn local_tunnel(front_end: SocketAddr) -> Tunnel {
        let config = TunnelConfig {
            front_end: front_end.to_string(),
            ..TunnelConfig::default()
        };
        Tunnel::new(Arc::new(HttpLookupClient::new().unwrap()), config)
    }

    #[tokio::test]
    async fn http_client_sends_host_header_to_front_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tunnel = local_tunnel(listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let head = read_request_head(&mut stream).await;
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\nConnection: close\r\n\r\n93.184.216.34",
                )
                .await
                .unwrap();
            stream.shutdown().await.unwrap();
            head
        });

        let address = tunnel.resolve("example.com").await.unwrap();
        let head = server.await.unwrap();

        assert_eq!(address, Ipv4Addr::new(93, 184, 216, 34));
        let request_line = head.lines().next().unwrap();
        assert_eq!(
            request_line,
            "GET /lookup.php?host=WlhoaGJYQnNaUzVqYjIwPQ== HTTP/1.1"
        );
        assert!(
            head.to_ascii_lowercase()
                .lines()
                .any(|line| line == "host: myhosts.sinaapp.com"),
            "request head: {}",
            head
        );
    }

    #[tokio::test]
    async fn http_client_times_out_on_silent_front_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tunnel = local_tunnel(listener.local_addr().unwrap());

        // Accept and hold the connection without ever answering.
        let (release, hold) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_request_head(&mut stream).await;
            let _ = hold.await;
        });

        let started = Instant::now();
        let result = tunnel.resolve("example.com").await;
        let elapsed = started.elapsed();
        drop(release);

        assert!(matches!(result, Err(Error::Tunnel(_))), "{:?}", result);
        assert!(elapsed >= LOOKUP_TIMEOUT - Duration::from_millis(500), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(20), "{:?}", elapsed);
    }
}
