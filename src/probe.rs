//! Network Probes
//!
//! Stateless reachability checks for tunnel endpoints: a plain TCP
//! port-listen probe and an end-to-end HTTP-through-SOCKS5 probe. Negative
//! results are expected during start-up, so they are only logged at debug.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

/// Health prober with a fixed per-call timeout
#[derive(Debug, Clone)]
pub struct Probe {
    timeout: Duration,
    test_url: String,
}

impl Probe {
    pub fn new(timeout: Duration, test_url: impl Into<String>) -> Self {
        Self {
            timeout,
            test_url: test_url.into(),
        }
    }

    /// Check whether something accepts TCP connections on `host:port`.
    pub async fn is_port_listening(&self, host: &str, port: u16) -> bool {
        let addr = format!("{}:{}", host, port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Port check failed for {}: {}", addr, e);
                false
            }
            Err(_) => {
                debug!("Port check timed out for {}", addr);
                false
            }
        }
    }

    /// Fetch the test URL through `socks5://host:port`.
    ///
    /// Any HTTP response, even a 5xx, proves the proxy relays traffic; only
    /// proxy/transport failures and timeouts count against it. Redirects are
    /// not followed so a captive upstream cannot stall the probe.
    pub async fn socks5_reachable(&self, host: &str, port: u16) -> bool {
        let proxy_url = format!("socks5://{}:{}", host, port);
        let proxy = match reqwest::Proxy::all(&proxy_url) {
            Ok(proxy) => proxy,
            Err(e) => {
                debug!("Invalid proxy URL {}: {}", proxy_url, e);
                return false;
            }
        };
        let client = match reqwest::Client::builder()
            .proxy(proxy)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(self.timeout)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                debug!("Failed to build probe client for {}: {}", proxy_url, e);
                return false;
            }
        };
        match client.get(&self.test_url).send().await {
            Ok(response) => {
                debug!(
                    "SOCKS5 probe via {} got HTTP {}",
                    proxy_url,
                    response.status()
                );
                true
            }
            Err(e) => {
                debug!("SOCKS5 probe via {} failed: {}", proxy_url, e);
                false
            }
        }
    }

    /// Full tunnel check: port listening, then end-to-end SOCKS5 relay.
    /// Short-circuits on the first failure.
    pub async fn tunnel_healthy(&self, host: &str, port: u16) -> bool {
        if !self.is_port_listening(host, port).await {
            debug!("Port {} not listening on {}", port, host);
            return false;
        }
        if !self.socks5_reachable(host, port).await {
            debug!("SOCKS5 proxy {}:{} failed the relay check", host, port);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn probe() -> Probe {
        Probe::new(Duration::from_secs(1), "http://example.com")
    }

    #[tokio::test]
    async fn test_port_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe().is_port_listening("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn test_port_not_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!probe().is_port_listening("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn test_socks5_unreachable_on_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!probe().socks5_reachable("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn test_tunnel_healthy_short_circuits_on_dead_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!probe().tunnel_healthy("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn test_tunnel_unhealthy_when_listener_is_not_socks() {
        // Accepts TCP but never speaks SOCKS5, so the relay check must fail.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });
        assert!(!probe().tunnel_healthy("127.0.0.1", port).await);
        server.abort();
    }
}
