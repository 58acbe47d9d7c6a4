//! In-memory store for tests and ephemeral runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::{select_rule, EngineStore, Result};
use crate::models::{
    DiscoveryRequest, PriceObservation, ProductListing, ValidationRule, Verdict,
};

#[derive(Default)]
struct Inner {
    listings: HashMap<Uuid, ProductListing>,
    observations: Vec<PriceObservation>,
    requests: HashMap<Uuid, DiscoveryRequest>,
    rules: Vec<ValidationRule>,
}

/// HashMap-backed store with the same observation semantics as the
/// SQLite implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn save_listing(&self, listing: &ProductListing) -> Result<()> {
        self.lock().listings.insert(listing.id, listing.clone());
        Ok(())
    }

    async fn get_listing(&self, id: Uuid) -> Result<Option<ProductListing>> {
        Ok(self.lock().listings.get(&id).cloned())
    }

    async fn find_listing(
        &self,
        retailer_id: &str,
        url: &str,
        sku: Option<&str>,
    ) -> Result<Option<ProductListing>> {
        let inner = self.lock();
        let by_url = inner
            .listings
            .values()
            .find(|l| l.retailer_id == retailer_id && l.url == url);
        if let Some(listing) = by_url {
            return Ok(Some(listing.clone()));
        }
        if let Some(sku) = sku {
            let by_sku = inner
                .listings
                .values()
                .find(|l| l.retailer_id == retailer_id && l.sku.as_deref() == Some(sku));
            return Ok(by_sku.cloned());
        }
        Ok(None)
    }

    async fn load_active_listings(
        &self,
        retailer_id: Option<&str>,
    ) -> Result<Vec<ProductListing>> {
        let inner = self.lock();
        let mut listings: Vec<_> = inner
            .listings
            .values()
            .filter(|l| l.active && retailer_id.is_none_or(|r| l.retailer_id == r))
            .cloned()
            .collect();
        listings.sort_by_key(|l| l.created_at);
        Ok(listings)
    }

    async fn sibling_prices(&self, variant: &str, exclude: Uuid) -> Result<Vec<f64>> {
        let inner = self.lock();
        Ok(inner
            .listings
            .values()
            .filter(|l| l.variant == variant && l.id != exclude && l.active)
            .filter_map(|l| l.last_known_price)
            .collect())
    }

    async fn record_observation(&self, observation: &PriceObservation) -> Result<()> {
        let mut inner = self.lock();

        let duplicate = inner.observations.iter().any(|o| {
            o.listing_id == observation.listing_id
                && o.recorded_at == observation.recorded_at
                && o.price == observation.price
        });
        if !duplicate {
            inner.observations.push(observation.clone());
        }

        let has_newer_valid = inner.observations.iter().any(|o| {
            o.listing_id == observation.listing_id
                && o.verdict == Verdict::Valid
                && o.recorded_at > observation.recorded_at
        });

        if let Some(listing) = inner.listings.get_mut(&observation.listing_id) {
            listing.consecutive_failures = 0;
            listing.last_scraped_at = Some(
                listing
                    .last_scraped_at
                    .map_or(observation.recorded_at, |t| t.max(observation.recorded_at)),
            );
            if observation.verdict == Verdict::Valid && !has_newer_valid {
                listing.last_known_price = Some(observation.price);
            }
        }
        Ok(())
    }

    async fn load_observations(
        &self,
        listing_id: Uuid,
        limit: u32,
    ) -> Result<Vec<PriceObservation>> {
        let inner = self.lock();
        let mut history: Vec<_> = inner
            .observations
            .iter()
            .filter(|o| o.listing_id == listing_id)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        history.truncate(limit as usize);
        Ok(history)
    }

    async fn record_listing_failure(&self, listing_id: Uuid) -> Result<()> {
        if let Some(listing) = self.lock().listings.get_mut(&listing_id) {
            listing.consecutive_failures += 1;
        }
        Ok(())
    }

    async fn save_discovery_request(&self, request: &DiscoveryRequest) -> Result<()> {
        self.lock().requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_discovery_request(&self, id: Uuid) -> Result<Option<DiscoveryRequest>> {
        Ok(self.lock().requests.get(&id).cloned())
    }

    async fn replace_validation_rules(&self, rules: &[ValidationRule]) -> Result<()> {
        self.lock().rules = rules.to_vec();
        Ok(())
    }

    async fn load_validation_rules(&self, category: Option<&str>) -> Result<ValidationRule> {
        Ok(select_rule(&self.lock().rules, category))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StockStatus, TaskSource};
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn later_valid_observation_wins() {
        let store = MemoryStore::new();
        let listing = ProductListing::new("whey-1kg", "shop", "https://shop.example/p/whey");
        store.save_listing(&listing).await.unwrap();

        let earlier = PriceObservation::new(
            listing.id,
            2_499.0,
            None,
            StockStatus::InStock,
            TaskSource::Scheduled,
        );
        let mut later = earlier.clone();
        later.id = Uuid::new_v4();
        later.price = 2_299.0;
        later.recorded_at = earlier.recorded_at + ChronoDuration::hours(1);

        store.record_observation(&later).await.unwrap();
        // Out-of-order arrival: the earlier observation lands second but
        // must not clobber the newer price.
        store.record_observation(&earlier).await.unwrap();

        let loaded = store.get_listing(listing.id).await.unwrap().unwrap();
        assert_eq!(loaded.last_known_price, Some(2_299.0));
    }
}
