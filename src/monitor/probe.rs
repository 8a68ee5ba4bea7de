//! Health probing through an upstream
//!
//! A probe is only meaningful when the request is routed *through* the
//! candidate upstream; a direct request would test the target site, not
//! the proxy. Non-200 responses, connection refusals, TLS failures, and
//! timeouts all collapse to a single "not ok" - the scheduler never
//! branches on the failure subtype.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Proxy};
use tracing::debug;

use crate::upstream::Upstream;

/// Outcome of a single reachability check
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// Whether the upstream relayed the request successfully
    pub ok: bool,
    /// Round-trip latency when a response (of any status) arrived
    pub latency: Option<Duration>,
    /// Distinguishing failure text, for diagnostics only
    pub error: Option<String>,
}

impl ProbeOutcome {
    fn pass(latency: Duration) -> Self {
        Self {
            ok: true,
            latency: Some(latency),
            error: None,
        }
    }

    fn fail(latency: Option<Duration>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            latency,
            error: Some(error.into()),
        }
    }
}

/// One reachability check issued through a candidate upstream.
///
/// Stateless; safe to call concurrently for different endpoints.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Fetch `check_url` through `upstream` within `timeout`
    async fn probe(&self, upstream: &Upstream, check_url: &str, timeout: Duration)
    -> ProbeOutcome;
}

/// HTTP GET through the upstream proxy
#[derive(Default)]
pub struct HttpProbe;

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(
        &self,
        upstream: &Upstream,
        check_url: &str,
        timeout: Duration,
    ) -> ProbeOutcome {
        let Some(proxy_url) = upstream.proxy_url() else {
            // VLESS tunnels only exist inside the engine; their liveness
            // shows up through real traffic, not through a direct probe.
            return ProbeOutcome {
                ok: true,
                latency: None,
                error: Some(format!(
                    "{} upstreams cannot be probed directly",
                    upstream.protocol
                )),
            };
        };

        debug!(upstream = %upstream.addr(), url = check_url, "Probing upstream");

        let client = match Proxy::all(&proxy_url)
            .map_err(|e| e.to_string())
            .and_then(|proxy| {
                Client::builder()
                    .proxy(proxy)
                    .timeout(timeout)
                    .build()
                    .map_err(|e| e.to_string())
            }) {
            Ok(client) => client,
            Err(e) => return ProbeOutcome::fail(None, format!("probe client: {e}")),
        };

        let started = Instant::now();
        match client.get(check_url).send().await {
            Ok(response) => {
                let latency = started.elapsed();
                let status = response.status();
                if status.as_u16() == 200 {
                    ProbeOutcome::pass(latency)
                } else {
                    ProbeOutcome::fail(Some(latency), format!("HTTP status code {status}"))
                }
            }
            Err(e) => {
                let detail = if e.is_timeout() {
                    format!("timeout after {}s", timeout.as_secs())
                } else {
                    e.to_string()
                };
                ProbeOutcome::fail(None, detail)
            }
        }
    }
}
