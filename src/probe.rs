//! HTTP connectivity probe
//!
//! Issues a single GET to a well-known URL that answers `204 No Content` when
//! the internet is reachable. Anything else tells us something sits in between.

use crate::error::{DetectorError, Result};
use crate::models::{AttemptResult, ProbeOutcome};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, RETRY_AFTER, USER_AGENT};
use reqwest::{redirect, Client, Response, StatusCode};
use std::time::{Duration, Instant};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport that runs one connectivity probe
///
/// Never fails: transport errors and timeouts come back as
/// [`ProbeOutcome::NoResponse`].
#[async_trait]
pub trait ProbeClient: Send + Sync {
    async fn probe(&self, url: &Url, timeout: Duration) -> AttemptResult;
}

pub struct HttpProbe {
    inner: Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("portald/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        // Redirects are the portal signal, never follow them
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(CONNECT_TIMEOUT)
            .default_headers(headers)
            .build()?;

        Ok(Self { inner: client })
    }

    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<Response> {
        let request = self.inner.get(url.clone()).timeout(timeout).send();
        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) if e.is_timeout() => Err(DetectorError::ProbeTimeout(timeout)),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(DetectorError::ProbeTimeout(timeout)),
        }
    }
}

#[async_trait]
impl ProbeClient for HttpProbe {
    async fn probe(&self, url: &Url, timeout: Duration) -> AttemptResult {
        let started = Instant::now();

        match self.fetch(url, timeout).await {
            Ok(resp) => {
                let status = resp.status();
                let outcome = classify_response(status, resp.content_length());
                let retry_after = if outcome == ProbeOutcome::NoResponse {
                    resp.headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_retry_after)
                } else {
                    None
                };

                tracing::debug!("Probe {} -> {} ({})", url, status.as_u16(), outcome);

                AttemptResult {
                    outcome,
                    response_code: Some(status.as_u16()),
                    probe_duration: started.elapsed(),
                    retry_after,
                }
            }
            Err(e) => {
                if e.is_transient_probe_failure() {
                    tracing::debug!("Probe {} failed: {}", url, e);
                } else {
                    tracing::warn!("Probe {} failed: {}", url, e);
                }
                AttemptResult::no_response(started.elapsed())
            }
        }
    }
}

/// Map a probe response onto a coarse outcome
pub fn classify_response(status: StatusCode, content_length: Option<u64>) -> ProbeOutcome {
    match status {
        StatusCode::NO_CONTENT => ProbeOutcome::Online,
        // Some transparent proxies rewrite 204 into an empty 200
        StatusCode::OK if content_length == Some(0) => ProbeOutcome::Online,
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => ProbeOutcome::ProxyAuthRequired,
        // RFC 6585: the portal answers in place of the origin
        StatusCode::NETWORK_AUTHENTICATION_REQUIRED => ProbeOutcome::Portal,
        s if s.is_server_error() => ProbeOutcome::NoResponse,
        _ => ProbeOutcome::Portal,
    }
}

/// Delay-seconds form of `Retry-After`; HTTP dates are ignored
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Check that a probe URL is something we can actually GET
pub fn validate_probe_url(raw: &str) -> Result<Url> {
    let invalid = |reason: String| DetectorError::InvalidProbeUrl {
        url: raw.to_string(),
        reason,
    };

    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}
