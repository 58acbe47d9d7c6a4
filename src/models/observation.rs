//! Price observations - append-only history, never mutated after creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TaskSource;

/// Stock availability as extracted from the product page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    InStock,
    OutOfStock,
    Unknown,
}

impl StockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockStatus::InStock => "in_stock",
            StockStatus::OutOfStock => "out_of_stock",
            StockStatus::Unknown => "unknown",
        }
    }
}

/// Validator verdict; terminal per observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Valid,
    Suspicious,
    Rejected,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Valid => "valid",
            Verdict::Suspicious => "suspicious",
            Verdict::Rejected => "rejected",
        }
    }
}

/// A single price reading at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub price: f64,
    /// The listing's current price when this observation was made.
    pub previous_price: Option<f64>,
    pub change_amount: Option<f64>,
    pub change_percent: Option<f64>,
    /// [0,1]; gates alerting, not storage.
    pub confidence: f64,
    pub verdict: Verdict,
    pub stock: StockStatus,
    pub recorded_at: DateTime<Utc>,
    pub source: TaskSource,
}

impl PriceObservation {
    /// Build an observation relative to the listing's current price. The
    /// verdict and confidence start as valid/1.0 and are overwritten by
    /// the validator.
    pub fn new(
        listing_id: Uuid,
        price: f64,
        previous_price: Option<f64>,
        stock: StockStatus,
        source: TaskSource,
    ) -> Self {
        let change_amount = previous_price.map(|prev| price - prev);
        let change_percent = previous_price.and_then(|prev| {
            if prev.abs() < f64::EPSILON {
                None
            } else {
                Some((price - prev) / prev * 100.0)
            }
        });
        Self {
            id: Uuid::new_v4(),
            listing_id,
            price,
            previous_price,
            change_amount,
            change_percent,
            confidence: 1.0,
            verdict: Verdict::Valid,
            stock,
            recorded_at: Utc::now(),
            source,
        }
    }
}
