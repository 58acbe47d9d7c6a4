//! Persistence layer.
//!
//! The engine consumes persistence through the narrow `EngineStore` trait;
//! everything is transactional at the single-row level and nothing here
//! enforces engine invariants (the scheduler does that in memory).

mod memory;
mod sqlite;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{DiscoveryRequest, PriceObservation, ProductListing, ValidationRule};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Narrow persistence contract consumed by the engine.
#[async_trait]
pub trait EngineStore: Send + Sync {
    /// Insert or update a listing by id.
    async fn save_listing(&self, listing: &ProductListing) -> Result<()>;

    async fn get_listing(&self, id: Uuid) -> Result<Option<ProductListing>>;

    /// Dedup lookup: retailer + canonical URL, falling back to retailer SKU.
    async fn find_listing(
        &self,
        retailer_id: &str,
        url: &str,
        sku: Option<&str>,
    ) -> Result<Option<ProductListing>>;

    /// Active listings, optionally scoped to one retailer.
    async fn load_active_listings(&self, retailer_id: Option<&str>)
        -> Result<Vec<ProductListing>>;

    /// Current prices of sibling listings for the same variant at other
    /// retailers. Feeds the validator's agreement component.
    async fn sibling_prices(&self, variant: &str, exclude: Uuid) -> Result<Vec<f64>>;

    /// Append an observation and apply it to the listing.
    ///
    /// Idempotent: re-submitting the same observation (retry after a
    /// persistence timeout) is a no-op, and only a valid observation with
    /// a timestamp at or after the listing's last scrape may update
    /// `last_known_price` - the later-timestamped observation always wins.
    async fn record_observation(&self, observation: &PriceObservation) -> Result<()>;

    /// Observation history for a listing, newest first.
    async fn load_observations(
        &self,
        listing_id: Uuid,
        limit: u32,
    ) -> Result<Vec<PriceObservation>>;

    /// Bump the listing's consecutive failure counter.
    async fn record_listing_failure(&self, listing_id: Uuid) -> Result<()>;

    async fn save_discovery_request(&self, request: &DiscoveryRequest) -> Result<()>;

    async fn get_discovery_request(&self, id: Uuid) -> Result<Option<DiscoveryRequest>>;

    /// Replace the stored rule set; called when configuration (re)loads.
    async fn replace_validation_rules(&self, rules: &[ValidationRule]) -> Result<()>;

    /// Rule for a category, falling back to the global rule, falling back
    /// to defaults.
    async fn load_validation_rules(&self, category: Option<&str>) -> Result<ValidationRule>;
}

/// Pick the most specific rule available for a category.
pub(crate) fn select_rule(rules: &[ValidationRule], category: Option<&str>) -> ValidationRule {
    if let Some(category) = category {
        if let Some(rule) = rules
            .iter()
            .find(|r| r.category.as_deref() == Some(category))
        {
            return rule.clone();
        }
    }
    rules
        .iter()
        .find(|r| r.category.is_none())
        .cloned()
        .unwrap_or_default()
}
