//! Product discovery.
//!
//! Turns a user search into tracked listings: fan the query out to the
//! requested retailers' search surfaces, dedupe the candidates against
//! known listings and register the rest. One retailer failing never fails
//! the request; its error is recorded on the request instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{CircuitBreaker, TaskQueue};
use crate::identity::IdentityRotator;
use crate::models::{
    DiscoveryRequest, DiscoveryStatus, ProductListing, RetailerError, ScrapeTask, TaskSource,
};
use crate::rate_limit::{AdmitOutcome, RateGovernor};
use crate::repository::EngineStore;
use crate::scrapers::{Candidate, FetcherRegistry};

/// Priority of the initial scrape enqueued for a discovered listing.
/// Above scheduled refreshes, below immediate user scrapes.
const DISCOVERY_PRIORITY: u8 = 6;

/// Executes discovery requests. Shares the engine's governor, identities
/// and queue so discovery traffic counts against the same limits.
pub struct DiscoveryProcessor {
    pub store: Arc<dyn EngineStore>,
    pub registry: Arc<FetcherRegistry>,
    pub governor: Arc<RateGovernor>,
    pub rotator: Arc<IdentityRotator>,
    pub breaker: Arc<CircuitBreaker>,
    pub queue: Arc<TaskQueue>,
    pub search_timeout: Duration,
    pub max_attempts: u32,
}

impl DiscoveryProcessor {
    /// Run one request to completion and persist the result snapshot.
    pub async fn process(&self, mut request: DiscoveryRequest) {
        request.status = DiscoveryStatus::Processing;
        if let Err(err) = self.store.save_discovery_request(&request).await {
            warn!(request = %request.id, error = %err, "saving discovery request failed");
        }

        let mut any_succeeded = false;
        for retailer_id in request.retailers.clone() {
            match self.search_retailer(&retailer_id, &request.query).await {
                Ok(candidates) => {
                    any_succeeded = true;
                    for candidate in candidates {
                        match self.register(&retailer_id, &request.query, candidate).await {
                            Ok(listing_id) => {
                                if !request.listing_ids.contains(&listing_id) {
                                    request.listing_ids.push(listing_id);
                                }
                            }
                            Err(err) => {
                                warn!(
                                    retailer = %retailer_id,
                                    error = %err,
                                    "registering candidate failed"
                                );
                            }
                        }
                    }
                }
                Err(message) => {
                    debug!(retailer = %retailer_id, message, "retailer search failed");
                    request.errors.push(RetailerError {
                        retailer_id,
                        message,
                    });
                }
            }
        }

        request.status = if any_succeeded || request.retailers.is_empty() {
            DiscoveryStatus::Completed
        } else {
            DiscoveryStatus::Failed
        };
        request.completed_at = Some(Utc::now());
        info!(
            request = %request.id,
            query = %request.query,
            listings = request.listing_ids.len(),
            errors = request.errors.len(),
            status = request.status.as_str(),
            "discovery request finished"
        );
        if let Err(err) = self.store.save_discovery_request(&request).await {
            warn!(request = %request.id, error = %err, "saving discovery result failed");
        }
    }

    /// Search one retailer, mapping every obstacle to an error message.
    async fn search_retailer(
        &self,
        retailer_id: &str,
        query: &str,
    ) -> Result<Vec<Candidate>, String> {
        let Some(fetcher) = self.registry.get(retailer_id) else {
            return Err("no fetcher registered".into());
        };
        if !self.breaker.allows(retailer_id) {
            return Err("retailer suspended by circuit breaker".into());
        }
        match self.governor.admit(retailer_id).await {
            AdmitOutcome::Admitted => {}
            AdmitOutcome::Deferred(wait) => {
                return Err(format!("rate limit wait of {wait:?} exceeds the cap"));
            }
        }

        let identity = self.rotator.next(retailer_id);
        match fetcher.search(query, &identity, self.search_timeout).await {
            Ok(candidates) => {
                self.breaker.record(retailer_id, true);
                self.rotator.report_success(retailer_id, identity.slot);
                Ok(candidates)
            }
            Err(err) => {
                self.breaker.record(retailer_id, false);
                if err.kind.blames_identity() {
                    self.rotator.report_failure(retailer_id, identity.slot);
                }
                Err(err.to_string())
            }
        }
    }

    /// Dedupe a candidate against known listings; register and enqueue an
    /// initial scrape when it is new.
    async fn register(
        &self,
        retailer_id: &str,
        query: &str,
        candidate: Candidate,
    ) -> crate::repository::Result<Uuid> {
        if let Some(existing) = self
            .store
            .find_listing(retailer_id, &candidate.url, candidate.sku.as_deref())
            .await?
        {
            debug!(listing = %existing.id, url = %candidate.url, "candidate matches known listing");
            return Ok(existing.id);
        }

        let listing = ProductListing::new(&variant_slug(&candidate.title, query), retailer_id, &candidate.url)
            .with_sku(candidate.sku.clone());
        self.store.save_listing(&listing).await?;
        info!(
            listing = %listing.id,
            retailer = retailer_id,
            title = %candidate.title,
            "registered new listing"
        );

        self.queue.enqueue(ScrapeTask::new(
            listing.id,
            retailer_id,
            DISCOVERY_PRIORITY,
            TaskSource::Discovery,
            Utc::now(),
            self.max_attempts,
        ));
        Ok(listing.id)
    }
}

/// Stable variant reference derived from the candidate title, falling back
/// to the query when the title is unusable.
fn variant_slug(title: &str, fallback: &str) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        variant_slug(fallback, "unnamed")
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_normalizes_titles() {
        assert_eq!(
            variant_slug("Whey Isolate 1kg (Chocolate)", "q"),
            "whey-isolate-1kg-chocolate"
        );
        assert_eq!(variant_slug("  ", "whey protein"), "whey-protein");
        assert_eq!(variant_slug("---", "***"), "unnamed");
    }
}
