//! Retailer configuration entity.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A window during which a retailer runs site-wide sales and prices
/// move often enough to justify a shorter refresh interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalePeriod {
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl SalePeriod {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.starts_at && at <= self.ends_at
    }
}

/// Scraping parameters for a single retailer.
///
/// Mutated by administrators only; the rate governor and scheduler read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Retailer {
    /// Stable identifier, e.g. "bigbasket".
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Token-bucket limit per sliding minute.
    #[serde(default = "default_per_minute")]
    pub requests_per_minute: u32,
    /// Token-bucket limit per sliding hour.
    #[serde(default = "default_per_hour")]
    pub requests_per_hour: u32,
    /// Floor on spacing between consecutive requests, in milliseconds.
    #[serde(default = "default_spacing_ms")]
    pub min_request_spacing_ms: u64,
    /// Whether outbound requests rotate (proxy, user-agent) identities.
    #[serde(default = "default_true")]
    pub rotate_identity: bool,
    /// Trailing failure rate above which the circuit breaker opens.
    #[serde(default = "default_failure_tolerance")]
    pub failure_rate_tolerance: f64,
    /// Base refresh interval for active listings, in seconds.
    #[serde(default = "default_scrape_interval")]
    pub scrape_interval_secs: u64,
    /// Refresh interval while a sale period is in effect, in seconds.
    #[serde(default = "default_sale_interval")]
    pub sale_interval_secs: u64,
    /// Optional sale window.
    #[serde(default)]
    pub sale_period: Option<SalePeriod>,
}

impl Retailer {
    pub fn min_request_spacing(&self) -> Duration {
        Duration::from_millis(self.min_request_spacing_ms)
    }

    /// Effective refresh interval at the given time.
    pub fn refresh_interval(&self, at: DateTime<Utc>) -> Duration {
        let secs = match &self.sale_period {
            Some(period) if period.contains(at) => self.sale_interval_secs,
            _ => self.scrape_interval_secs,
        };
        Duration::from_secs(secs)
    }

    /// Refresh task priority: 3-5 normally, raised during sale periods.
    pub fn refresh_priority(&self, at: DateTime<Utc>) -> u8 {
        match &self.sale_period {
            Some(period) if period.contains(at) => 5,
            _ => 3,
        }
    }
}

fn default_per_minute() -> u32 {
    10
}

fn default_per_hour() -> u32 {
    300
}

fn default_spacing_ms() -> u64 {
    2_000
}

fn default_true() -> bool {
    true
}

fn default_failure_tolerance() -> f64 {
    0.15
}

fn default_scrape_interval() -> u64 {
    6 * 60 * 60
}

fn default_sale_interval() -> u64 {
    60 * 60
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn retailer_with_sale() -> Retailer {
        Retailer {
            id: "shop".into(),
            name: "Shop".into(),
            requests_per_minute: 10,
            requests_per_hour: 300,
            min_request_spacing_ms: 2_000,
            rotate_identity: true,
            failure_rate_tolerance: 0.15,
            scrape_interval_secs: 21_600,
            sale_interval_secs: 3_600,
            sale_period: Some(SalePeriod {
                starts_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
                ends_at: Utc.with_ymd_and_hms(2026, 1, 7, 0, 0, 0).unwrap(),
            }),
        }
    }

    #[test]
    fn sale_period_shortens_interval() {
        let retailer = retailer_with_sale();
        let during = Utc.with_ymd_and_hms(2026, 1, 3, 12, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();

        assert_eq!(retailer.refresh_interval(during), Duration::from_secs(3_600));
        assert_eq!(retailer.refresh_interval(after), Duration::from_secs(21_600));
        assert_eq!(retailer.refresh_priority(during), 5);
        assert_eq!(retailer.refresh_priority(after), 3);
    }
}
