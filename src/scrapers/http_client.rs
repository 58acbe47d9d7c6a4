//! HTTP layer shared by retailer fetchers.
//!
//! Builds a reqwest client per request so the identity's proxy and
//! user-agent apply, issues the request under the caller's timeout, and
//! classifies transport and status failures into `FailureKind`.

use std::time::Duration;

use reqwest::{Client, Proxy, StatusCode};

use super::{FailureKind, FetchError};
use crate::identity::Identity;

/// Markers that indicate a bot-detection or challenge page rather than
/// real product content.
const CHALLENGE_MARKERS: &[&str] = &[
    "captcha",
    "unusual traffic",
    "are you a robot",
    "access denied",
    "cf-challenge",
    "attention required",
];

/// Thin wrapper over reqwest tied to one identity.
pub struct FetchClient {
    client: Client,
}

impl FetchClient {
    /// Build a client for one request using the identity's proxy and
    /// user-agent and the caller-supplied timeout.
    pub fn for_identity(identity: &Identity, timeout: Duration) -> Result<Self, FetchError> {
        let mut builder = Client::builder()
            .user_agent(&identity.user_agent)
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .cookie_store(true);

        if let Some(proxy_url) = &identity.proxy {
            let proxy = Proxy::all(proxy_url).map_err(|e| {
                FetchError::new(FailureKind::NetworkError, format!("bad proxy url: {e}"))
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| {
            FetchError::new(FailureKind::NetworkError, format!("client build failed: {e}"))
        })?;
        Ok(Self { client })
    }

    /// GET a page and return its body, classifying every failure mode.
    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .header("Accept", "text/html,application/xhtml+xml")
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if let Some(err) = classify_status(status) {
            return Err(err);
        }

        let body = response
            .text()
            .await
            .map_err(classify_transport_error)?;

        if let Some(marker) = challenge_marker(&body) {
            return Err(FetchError::new(
                FailureKind::BlockedOrChallenged,
                format!("challenge page detected (marker: {marker:?})"),
            )
            .with_snippet(&body));
        }

        Ok(body)
    }
}

fn classify_transport_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::new(FailureKind::NetworkTimeout, format!("request timed out: {err}"))
    } else {
        FetchError::new(FailureKind::NetworkError, format!("request failed: {err}"))
    }
}

/// Map a non-success status to a failure, or None for 2xx.
fn classify_status(status: StatusCode) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    let kind = match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => FailureKind::RateLimited,
        StatusCode::FORBIDDEN => FailureKind::BlockedOrChallenged,
        s if s.is_server_error() => FailureKind::NetworkError,
        _ => FailureKind::ExtractionFailure,
    };
    Some(FetchError::new(kind, format!("HTTP {status}")))
}

/// Case-insensitive scan of the page head for challenge markers. Only the
/// first chunk is scanned; challenge pages are short.
fn challenge_marker(body: &str) -> Option<&'static str> {
    let end = body
        .char_indices()
        .nth(4_096)
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    let head = body[..end].to_lowercase();
    CHALLENGE_MARKERS.iter().find(|m| head.contains(**m)).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS).map(|e| e.kind),
            Some(FailureKind::RateLimited)
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN).map(|e| e.kind),
            Some(FailureKind::BlockedOrChallenged)
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY).map(|e| e.kind),
            Some(FailureKind::NetworkError)
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND).map(|e| e.kind),
            Some(FailureKind::ExtractionFailure)
        );
        assert!(classify_status(StatusCode::OK).is_none());
    }

    #[test]
    fn challenge_page_is_detected() {
        let body = "<html><title>Attention Required! | Cloudflare</title></html>";
        assert!(challenge_marker(body).is_some());

        let normal = "<html><title>Whey Protein 1kg</title><span>₹2,499</span></html>";
        assert!(challenge_marker(normal).is_none());
    }

    #[test]
    fn marker_scan_only_covers_page_head() {
        let mut body = "x".repeat(10_000);
        body.push_str("captcha");
        assert!(challenge_marker(&body).is_none());
    }
}
