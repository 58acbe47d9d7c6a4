//! Per-retailer failure tracking and circuit breaking.
//!
//! Outcomes are kept in a count-based trailing window (the last 50
//! requests per retailer). Count-based keeps the breaker equally
//! sensitive for slow and fast retailers; 50 gives a few failures of
//! headroom at the default 15% tolerance before tripping.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

/// Trailing window length, in requests.
const WINDOW: usize = 50;

/// Trips only after this many outcomes exist; a single early failure
/// must not suspend a retailer.
const MIN_SAMPLES: usize = 10;

/// Breaker state for one retailer, as reported by the health surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
}

/// Health snapshot for one retailer.
#[derive(Debug, Clone, Serialize)]
pub struct RetailerHealth {
    pub retailer_id: String,
    /// Success rate over the trailing window, 0..=1. 1.0 when no data.
    pub success_rate: f64,
    pub breaker: BreakerState,
    pub samples: usize,
}

/// Engine-wide health snapshot for the observability surface.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub queue_depth: usize,
    pub retailers: Vec<RetailerHealth>,
}

struct RetailerWindow {
    outcomes: VecDeque<bool>,
    failure_tolerance: f64,
    open_until: Option<Instant>,
}

impl RetailerWindow {
    fn new(failure_tolerance: f64) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(WINDOW),
            failure_tolerance,
            open_until: None,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }
}

/// Tracks outcomes and suspends dispatch to retailers whose trailing
/// failure rate exceeds their tolerance.
pub struct CircuitBreaker {
    cooldown: Duration,
    windows: Mutex<HashMap<String, RetailerWindow>>,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RetailerWindow>> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the failure tolerance for a retailer (from config).
    pub fn configure(&self, retailer_id: &str, failure_tolerance: f64) {
        let mut windows = self.lock();
        windows
            .entry(retailer_id.to_string())
            .and_modify(|w| w.failure_tolerance = failure_tolerance)
            .or_insert_with(|| RetailerWindow::new(failure_tolerance));
    }

    /// Record a request outcome and trip the breaker when warranted.
    pub fn record(&self, retailer_id: &str, success: bool) {
        let mut windows = self.lock();
        let window = windows
            .entry(retailer_id.to_string())
            .or_insert_with(|| RetailerWindow::new(0.15));

        if window.outcomes.len() == WINDOW {
            window.outcomes.pop_front();
        }
        window.outcomes.push_back(success);

        if window.open_until.is_none()
            && window.outcomes.len() >= MIN_SAMPLES
            && window.failure_rate() > window.failure_tolerance
        {
            window.open_until = Some(Instant::now() + self.cooldown);
            warn!(
                retailer = retailer_id,
                failure_rate = window.failure_rate(),
                cooldown = ?self.cooldown,
                "circuit breaker opened"
            );
        }
    }

    /// Whether dispatch to this retailer is currently allowed. An expired
    /// cooldown closes the breaker and clears the window so the retailer
    /// re-earns its record.
    pub fn allows(&self, retailer_id: &str) -> bool {
        let mut windows = self.lock();
        let Some(window) = windows.get_mut(retailer_id) else {
            return true;
        };
        match window.open_until {
            None => true,
            Some(until) if Instant::now() >= until => {
                window.open_until = None;
                window.outcomes.clear();
                info!(retailer = retailer_id, "circuit breaker closed after cooldown");
                true
            }
            Some(_) => false,
        }
    }

    /// Per-retailer snapshot for the health surface.
    pub fn snapshot(&self) -> Vec<RetailerHealth> {
        let windows = self.lock();
        let mut report: Vec<RetailerHealth> = windows
            .iter()
            .map(|(id, window)| {
                let open = window
                    .open_until
                    .is_some_and(|until| Instant::now() < until);
                RetailerHealth {
                    retailer_id: id.clone(),
                    success_rate: 1.0 - window.failure_rate(),
                    breaker: if open {
                        BreakerState::Open
                    } else {
                        BreakerState::Closed
                    },
                    samples: window.outcomes.len(),
                }
            })
            .collect();
        report.sort_by(|a, b| a.retailer_id.cmp(&b.retailer_id));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_stays_closed_under_tolerance() {
        let breaker = CircuitBreaker::new(Duration::from_secs(300));
        breaker.configure("shop", 0.15);

        // 1 failure in 20: 5%, under the 15% tolerance.
        for i in 0..20 {
            breaker.record("shop", i != 0);
        }
        assert!(breaker.allows("shop"));
    }

    #[test]
    fn breaker_opens_on_sustained_failure() {
        let breaker = CircuitBreaker::new(Duration::from_secs(300));
        breaker.configure("shop", 0.15);

        for i in 0..20 {
            breaker.record("shop", i % 3 != 0); // ~33% failures
        }
        assert!(!breaker.allows("shop"));

        let health = breaker.snapshot();
        assert_eq!(health[0].breaker, BreakerState::Open);
        assert!(health[0].success_rate < 0.85);
    }

    #[test]
    fn few_samples_never_trip() {
        let breaker = CircuitBreaker::new(Duration::from_secs(300));
        breaker.configure("shop", 0.15);

        for _ in 0..MIN_SAMPLES - 1 {
            breaker.record("shop", false);
        }
        assert!(breaker.allows("shop"));
    }

    #[test]
    fn cooldown_closes_and_resets() {
        let breaker = CircuitBreaker::new(Duration::from_millis(0));
        breaker.configure("shop", 0.15);

        for _ in 0..MIN_SAMPLES {
            breaker.record("shop", false);
        }
        // Zero cooldown: open expires immediately and the window resets.
        assert!(breaker.allows("shop"));
        assert_eq!(breaker.snapshot()[0].samples, 0);
    }

    #[test]
    fn unknown_retailer_is_allowed() {
        let breaker = CircuitBreaker::new(Duration::from_secs(300));
        assert!(breaker.allows("nobody"));
    }
}
