use std::net::SocketAddr;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::net::TcpStream;

pub const DEFAULT_SERVER_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Probes the candidate endpoints of a token in parallel and picks the
/// first that completes a TCP handshake, preferring IPv6 when the client
/// supports it.
pub struct ServerFinder {
    pub query_timeout: Duration,
    pub prefer_ipv6: bool,
}

impl Default for ServerFinder {
    fn default() -> Self {
        Self {
            query_timeout: DEFAULT_SERVER_QUERY_TIMEOUT,
            prefer_ipv6: false,
        }
    }
}

impl ServerFinder {
    pub async fn find(&self, endpoints: &[SocketAddr]) -> Option<SocketAddr> {
        if endpoints.is_empty() {
            return None;
        }

        let mut probes: FuturesUnordered<_> = endpoints
            .iter()
            .copied()
            .map(|ep| {
                let timeout = self.query_timeout;
                async move {
                    let ok = tokio::time::timeout(timeout, TcpStream::connect(ep))
                        .await
                        .map(|r| r.is_ok())
                        .unwrap_or(false);
                    (ep, ok)
                }
            })
            .collect();

        let mut fallback: Option<SocketAddr> = None;
        while let Some((ep, ok)) = probes.next().await {
            if !ok {
                continue;
            }
            if !self.prefer_ipv6 || ep.is_ipv6() {
                return Some(ep);
            }
            fallback.get_or_insert(ep);
        }
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn picks_a_live_endpoint_over_dead_ones() {
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap();
        // TEST-NET-1 is unroutable; the probe must time out, not error fast,
        // so keep the timeout small.
        let dead: SocketAddr = "192.0.2.1:9".parse().unwrap();

        let finder = ServerFinder {
            query_timeout: Duration::from_millis(500),
            prefer_ipv6: false,
        };
        let got = finder.find(&[dead, live_addr]).await;
        assert_eq!(got, Some(live_addr));
    }

    #[tokio::test]
    async fn no_endpoints_is_none() {
        let finder = ServerFinder::default();
        assert_eq!(finder.find(&[]).await, None);
    }

    #[tokio::test]
    async fn ipv4_is_used_when_no_ipv6_answers() {
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap();
        let dead6: SocketAddr = "[2001:db8::1]:9".parse().unwrap();

        let finder = ServerFinder {
            query_timeout: Duration::from_millis(500),
            prefer_ipv6: true,
        };
        let got = finder.find(&[dead6, live_addr]).await;
        assert_eq!(got, Some(live_addr));
    }
}
