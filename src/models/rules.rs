//! Price validation rules.

use serde::{Deserialize, Serialize};

/// Acceptance bounds for observed prices. Global when `category` is unset,
/// otherwise scoped to one category. Read-only at validation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(default)]
    pub category: Option<String>,
    /// Accept prices down to this multiple of the rolling average, inclusive.
    #[serde(default = "default_min_multiplier")]
    pub min_price_multiplier: f64,
    /// Accept prices up to this multiple of the rolling average, inclusive.
    #[serde(default = "default_max_multiplier")]
    pub max_price_multiplier: f64,
    /// Per-gram price floor, when the category has one.
    #[serde(default)]
    pub min_price_per_gram: Option<f64>,
    /// Per-gram price ceiling, when the category has one.
    #[serde(default)]
    pub max_price_per_gram: Option<f64>,
    /// Day-over-day change above this percentage flags (not rejects).
    #[serde(default = "default_max_daily_change")]
    pub max_daily_change_pct: f64,
}

impl Default for ValidationRule {
    fn default() -> Self {
        Self {
            category: None,
            min_price_multiplier: default_min_multiplier(),
            max_price_multiplier: default_max_multiplier(),
            min_price_per_gram: None,
            max_price_per_gram: None,
            max_daily_change_pct: default_max_daily_change(),
        }
    }
}

fn default_min_multiplier() -> f64 {
    0.1
}

fn default_max_multiplier() -> f64 {
    10.0
}

fn default_max_daily_change() -> f64 {
    50.0
}
