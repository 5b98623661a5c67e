//! Health probing.
//!
//! A probe is a single request against a well-known endpoint; a health
//! gate is a bounded number of probes with a fixed think-time between
//! them. There is no backoff: the attempt ceiling and interval are part of
//! each phase's contract.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use deckhand_core::RetryPolicy;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

pub trait HealthProbe: Send + Sync {
    /// Probe `endpoint` once, giving up after `timeout`.
    fn check(&self, endpoint: &str, timeout: Duration) -> impl Future<Output = ProbeResult> + Send;
}

/// Plain HTTP/1.1 probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpProbe;

impl HealthProbe for HttpProbe {
    fn check(&self, endpoint: &str, timeout: Duration) -> impl Future<Output = ProbeResult> + Send {
        http_probe(endpoint, timeout)
    }
}

/// Outcome of a bounded polling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthVerdict {
    pub healthy: bool,
    /// Probes performed, including the successful one.
    pub attempts: u32,
}

/// Probe until the first success or until `policy.attempts` probes failed.
///
/// Sleeps `policy.interval` between attempts, never after the last one.
pub async fn poll_until_healthy<P: HealthProbe>(
    probe: &P,
    endpoint: &str,
    timeout: Duration,
    policy: RetryPolicy,
) -> HealthVerdict {
    for attempt in 1..=policy.attempts {
        let result = probe.check(endpoint, timeout).await;
        if result == ProbeResult::Healthy {
            info!(%endpoint, attempt, "health check passed");
            return HealthVerdict {
                healthy: true,
                attempts: attempt,
            };
        }

        warn!(
            %endpoint,
            attempt,
            max_attempts = policy.attempts,
            ?result,
            "health check failed"
        );
        if attempt < policy.attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    HealthVerdict {
        healthy: false,
        attempts: policy.attempts,
    }
}

/// Perform an HTTP health probe against a full `http://` URL.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(endpoint: &str, timeout: Duration) -> ProbeResult {
    let uri: http::Uri = match endpoint.parse() {
        Ok(uri) => uri,
        Err(e) => {
            debug!(error = %e, %endpoint, "invalid health endpoint");
            return ProbeResult::Failed;
        }
    };
    if uri.scheme_str() != Some("http") {
        debug!(%endpoint, "only http:// health endpoints are supported");
        return ProbeResult::Failed;
    }
    let Some(host) = uri.host() else {
        return ProbeResult::Failed;
    };
    let address = format!("{host}:{}", uri.port_u16().unwrap_or(80));
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(&address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %endpoint, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %endpoint, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&path)
            .header("host", &address)
            .header("user-agent", "deckhand-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %endpoint, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) => {
                if resp.status().is_success() {
                    ProbeResult::Healthy
                } else {
                    debug!(status = %resp.status(), %endpoint, "health probe non-2xx");
                    ProbeResult::Unhealthy
                }
            }
            Err(e) => {
                debug!(error = %e, %endpoint, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%endpoint, "health probe timed out");
            ProbeResult::Failed
        }
    }
}
