//! Retailer fetch executors.
//!
//! Each retailer implements the same contract: fetch one product page and
//! return a price plus stock status, or a classified failure. Retries never
//! happen here; retry policy belongs to the scheduler.

mod http_client;
mod price;
mod selector_fetcher;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::identity::Identity;
use crate::models::StockStatus;
pub use http_client::FetchClient;
pub use price::parse_price;
pub use selector_fetcher::{SelectorFetcher, SelectorSet};

/// Failure taxonomy for fetch attempts. Drives retry policy, identity
/// demotion and the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// HTTP 429 or detected throttling. Backs off longer than a standard
    /// retry and does not count fully against max_attempts.
    RateLimited,
    /// Request hit the per-task deadline.
    NetworkTimeout,
    /// Transport-level failure (DNS, connection reset, TLS).
    NetworkError,
    /// Bot-detection or challenge page. Demotes the identity that hit it.
    BlockedOrChallenged,
    /// Page fetched but the expected fields were not found; likely a
    /// layout change, so retried only a limited number of times.
    ExtractionFailure,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::NetworkTimeout => "network_timeout",
            FailureKind::NetworkError => "network_error",
            FailureKind::BlockedOrChallenged => "blocked_or_challenged",
            FailureKind::ExtractionFailure => "extraction_failure",
        }
    }

    /// Whether the failure should count against the identity that made
    /// the request rather than the retailer or the network at large.
    pub fn blames_identity(&self) -> bool {
        matches!(self, FailureKind::BlockedOrChallenged)
    }
}

/// A classified fetch failure.
#[derive(Debug, Clone, Error)]
#[error("{} ({})", message, kind.as_str())]
pub struct FetchError {
    pub kind: FailureKind,
    pub message: String,
    /// Raw page snippet kept for manual review of extraction failures.
    pub snippet: Option<String>,
}

impl FetchError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            snippet: None,
        }
    }

    pub fn with_snippet(mut self, snippet: &str) -> Self {
        // Enough context to diagnose a selector change, small enough to log.
        let end = snippet
            .char_indices()
            .nth(240)
            .map(|(i, _)| i)
            .unwrap_or(snippet.len());
        self.snippet = Some(snippet[..end].to_string());
        self
    }
}

/// A successfully extracted price reading.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPrice {
    pub price: f64,
    pub stock: StockStatus,
    pub title: Option<String>,
}

/// A product match returned by a retailer's search surface.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub title: String,
    /// Canonical product URL; primary dedup key together with retailer.
    pub url: String,
    pub sku: Option<String>,
    pub price: Option<f64>,
}

/// Common contract implemented once per retailer.
#[async_trait]
pub trait PriceFetcher: Send + Sync {
    /// Fetch one product page and extract price + stock.
    async fn fetch(
        &self,
        url: &str,
        identity: &Identity,
        timeout: Duration,
    ) -> Result<FetchedPrice, FetchError>;

    /// Search the retailer for candidate products.
    async fn search(
        &self,
        query: &str,
        identity: &Identity,
        timeout: Duration,
    ) -> Result<Vec<Candidate>, FetchError>;
}

/// Lookup table from retailer id to its fetch executor.
#[derive(Default)]
pub struct FetcherRegistry {
    fetchers: HashMap<String, Arc<dyn PriceFetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, retailer_id: &str, fetcher: Arc<dyn PriceFetcher>) {
        self.fetchers.insert(retailer_id.to_string(), fetcher);
    }

    pub fn get(&self, retailer_id: &str) -> Option<Arc<dyn PriceFetcher>> {
        self.fetchers.get(retailer_id).cloned()
    }

    pub fn retailer_ids(&self) -> Vec<String> {
        self.fetchers.keys().cloned().collect()
    }
}
