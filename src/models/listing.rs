//! Tracked product listings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A product variant as sold by a specific retailer, identified by its
/// canonical URL. Never deleted, only deactivated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductListing {
    pub id: Uuid,
    /// Product variant reference, e.g. "whey-isolate-1kg-chocolate".
    pub variant: String,
    pub retailer_id: String,
    /// Canonical product page URL; part of the dedup key.
    pub url: String,
    /// Retailer SKU, the fallback dedup key when URLs differ.
    pub sku: Option<String>,
    /// Category used to look up validation rules.
    pub category: Option<String>,
    /// Variant weight in grams, for per-unit price validation.
    pub unit_grams: Option<f64>,
    pub last_known_price: Option<f64>,
    pub last_scraped_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl ProductListing {
    /// Create a fresh listing for a newly discovered product.
    pub fn new(variant: &str, retailer_id: &str, url: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            variant: variant.to_string(),
            retailer_id: retailer_id.to_string(),
            url: url.to_string(),
            sku: None,
            category: None,
            unit_grams: None,
            last_known_price: None,
            last_scraped_at: None,
            consecutive_failures: 0,
            active: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_sku(mut self, sku: Option<String>) -> Self {
        self.sku = sku;
        self
    }
}
