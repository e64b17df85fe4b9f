use std::time::Duration;

use async_trait::async_trait;

/// A blocking-in-spirit reachability check; the monitor polls it on an interval.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Probes a list of HTTP endpoints in order. Any HTTP response at all counts
/// as reachable; only transport failures (DNS, connect, timeout) count as down.
pub struct HttpProbe {
    urls: Vec<String>,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(urls: Vec<String>, timeout: Duration) -> Self {
        Self {
            urls,
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn is_reachable(&self) -> bool {
        for url in &self.urls {
            match self.client.get(url).send().await {
                Ok(_) => return true,
                Err(e) => tracing::debug!(url = %url, error = %e, "reachability probe failed"),
            }
        }
        false
    }
}
