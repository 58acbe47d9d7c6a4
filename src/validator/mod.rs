//! Rule-based price validation.
//!
//! Every observation gets a terminal verdict (valid, suspicious, rejected)
//! and a confidence score in [0,1]. Rejected observations are still
//! persisted for audit but never update the listing's current price;
//! suspicious ones wait for a second consistent observation.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::{PriceObservation, ProductListing, ValidationRule, Verdict};

/// How many recent valid observations feed the rolling average.
const ROLLING_WINDOW: usize = 10;

/// Outcome of assessing one observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub verdict: Verdict,
    pub confidence: f64,
    /// Human-readable reason for a non-valid verdict.
    pub reason: Option<String>,
}

/// Everything the validator may consult. History is newest-first and
/// scoped to the observation's listing.
pub struct ValidationContext<'a> {
    pub listing: &'a ProductListing,
    pub history: &'a [PriceObservation],
    /// Current prices of sibling listings (same variant, other retailers).
    pub sibling_prices: &'a [f64],
    pub rule: &'a ValidationRule,
}

/// Stateless validator; rules arrive through the context.
#[derive(Debug, Default)]
pub struct PriceValidator;

impl PriceValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn assess(&self, price: f64, now: DateTime<Utc>, ctx: &ValidationContext<'_>) -> Assessment {
        if price <= 0.0 {
            return rejected(format!("non-positive price {price}"));
        }

        let rolling_avg = rolling_average(ctx);

        // Multiplier bounds against the rolling average, inclusive at both
        // ends: exactly min_multiplier x average is accepted.
        if let Some(avg) = rolling_avg {
            let ratio = price / avg;
            if ratio < ctx.rule.min_price_multiplier || ratio > ctx.rule.max_price_multiplier {
                return rejected(format!(
                    "price {price} is {ratio:.3}x the rolling average {avg:.2}, outside [{}, {}]",
                    ctx.rule.min_price_multiplier, ctx.rule.max_price_multiplier
                ));
            }
        }

        // Per-unit bounds, when the category configures them and the
        // listing knows its weight.
        if let Some(grams) = ctx.listing.unit_grams.filter(|g| *g > 0.0) {
            let per_gram = price / grams;
            if let Some(min) = ctx.rule.min_price_per_gram {
                if per_gram < min {
                    return rejected(format!(
                        "price per gram {per_gram:.4} below category floor {min}"
                    ));
                }
            }
            if let Some(max) = ctx.rule.max_price_per_gram {
                if per_gram > max {
                    return rejected(format!(
                        "price per gram {per_gram:.4} above category ceiling {max}"
                    ));
                }
            }
        }

        let confidence = self.confidence(price, now, rolling_avg, ctx);

        // Day-over-day swing flags, never rejects. A suspicious
        // predecessor that the new price agrees with is treated as
        // confirmation instead (the new observation is valid; the old one
        // keeps its verdict).
        if let Some(reference) = daily_change_reference(ctx) {
            let change_pct = ((price - reference) / reference * 100.0).abs();
            if change_pct > ctx.rule.max_daily_change_pct {
                if confirms_suspicious(price, ctx) {
                    debug!(
                        listing = %ctx.listing.id,
                        price,
                        "large move confirmed by consecutive agreement"
                    );
                } else {
                    return Assessment {
                        verdict: Verdict::Suspicious,
                        confidence,
                        reason: Some(format!(
                            "day-over-day change {change_pct:.1}% exceeds {}%",
                            ctx.rule.max_daily_change_pct
                        )),
                    };
                }
            }
        }

        Assessment {
            verdict: Verdict::Valid,
            confidence,
            reason: None,
        }
    }

    /// Confidence in [0,1]: corroboration recency, sibling agreement and
    /// distance from the rolling average. Monotonically non-increasing as
    /// deviation from the rolling average grows.
    fn confidence(
        &self,
        price: f64,
        now: DateTime<Utc>,
        rolling_avg: Option<f64>,
        ctx: &ValidationContext<'_>,
    ) -> f64 {
        // Recency: how fresh is the newest valid observation.
        let recency = ctx
            .history
            .iter()
            .find(|o| o.verdict == Verdict::Valid)
            .map(|o| {
                let age_hours = (now - o.recorded_at).num_minutes().max(0) as f64 / 60.0;
                1.0 / (1.0 + age_hours / 24.0)
            })
            .unwrap_or(0.5);

        // Agreement with sibling retailers' current prices.
        let agreement = median(ctx.sibling_prices)
            .filter(|m| *m > 0.0)
            .map(|m| {
                let distance = (price - m).abs() / m;
                1.0 / (1.0 + distance)
            })
            .unwrap_or(0.5);

        // Distance from expectation; dominant weight so the monotonicity
        // property holds regardless of the other components.
        let closeness = rolling_avg
            .filter(|avg| *avg > 0.0)
            .map(|avg| {
                let deviation = (price - avg).abs() / avg;
                1.0 / (1.0 + deviation)
            })
            .unwrap_or(1.0);

        (0.25 * recency + 0.25 * agreement + 0.5 * closeness).clamp(0.0, 1.0)
    }
}

fn rejected(reason: String) -> Assessment {
    Assessment {
        verdict: Verdict::Rejected,
        confidence: 0.0,
        reason: Some(reason),
    }
}

/// Mean of the most recent valid prices, falling back to the listing's
/// current price when history is empty. None for a brand-new listing,
/// which then has no baseline to reject against.
fn rolling_average(ctx: &ValidationContext<'_>) -> Option<f64> {
    let recent: Vec<f64> = ctx
        .history
        .iter()
        .filter(|o| o.verdict == Verdict::Valid)
        .take(ROLLING_WINDOW)
        .map(|o| o.price)
        .collect();
    if recent.is_empty() {
        return ctx.listing.last_known_price.filter(|p| *p > 0.0);
    }
    Some(recent.iter().sum::<f64>() / recent.len() as f64)
}

/// Reference price for the day-over-day check: the listing's current
/// price, or the newest valid observation when the listing has none.
fn daily_change_reference(ctx: &ValidationContext<'_>) -> Option<f64> {
    ctx.listing.last_known_price.filter(|p| *p > 0.0).or_else(|| {
        ctx.history
            .iter()
            .find(|o| o.verdict == Verdict::Valid)
            .map(|o| o.price)
    })
}

/// True when the immediately preceding observation was suspicious and the
/// new price sits close to it. Suspicious observations are never
/// retroactively promoted; agreement only makes the new one valid.
fn confirms_suspicious(price: f64, ctx: &ValidationContext<'_>) -> bool {
    let Some(last) = ctx.history.first() else {
        return false;
    };
    if last.verdict != Verdict::Suspicious || last.price <= 0.0 {
        return false;
    }
    let change_pct = ((price - last.price) / last.price * 100.0).abs();
    change_pct <= ctx.rule.max_daily_change_pct
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Some(sorted[sorted.len() / 2])
}
