//! Per-retailer rate governor.
//!
//! Enforces requests-per-minute, requests-per-hour and a minimum
//! inter-request spacing floor per retailer. Absence of capacity is
//! signaled by a wait duration, never by an error.

mod bucket;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

use crate::models::Retailer;
pub use bucket::{Admission, RetailerBucket, RetailerLimits};

/// Outcome of a blocking admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// A token was consumed; the caller may fetch now.
    Admitted,
    /// Capacity would not free up within the wait cap. The task should be
    /// deferred and rescheduled, not dropped.
    Deferred(Duration),
}

/// Token-bucket throttle shared by all workers.
#[derive(Debug)]
pub struct RateGovernor {
    /// Blocking admission waits at most this long before deferring.
    max_wait: Duration,
    buckets: Arc<RwLock<HashMap<String, RetailerBucket>>>,
}

impl RateGovernor {
    pub fn new(max_wait: Duration) -> Self {
        Self {
            max_wait,
            buckets: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Install or update limits for a set of retailers. Existing request
    /// history is kept so a config refresh cannot be used to burst.
    pub async fn configure(&self, retailers: &[Retailer]) {
        let mut buckets = self.buckets.write().await;
        for retailer in retailers {
            let limits = RetailerLimits {
                per_minute: retailer.requests_per_minute,
                per_hour: retailer.requests_per_hour,
                min_spacing: retailer.min_request_spacing(),
            };
            buckets
                .entry(retailer.id.clone())
                .and_modify(|b| b.set_limits(limits))
                .or_insert_with(|| RetailerBucket::new(limits));
        }
    }

    /// Non-blocking probe: would a request to this retailer be admitted
    /// right now? Consumes a token when it is.
    pub async fn try_admit(&self, retailer_id: &str) -> Admission {
        let mut buckets = self.buckets.write().await;
        match buckets.get_mut(retailer_id) {
            Some(bucket) => bucket.try_acquire_at(Instant::now()),
            // Unknown retailer: no configured limits to enforce.
            None => Admission::Proceed,
        }
    }

    /// Block until both buckets permit a request, up to the wait cap.
    pub async fn admit(&self, retailer_id: &str) -> AdmitOutcome {
        let deadline = Instant::now() + self.max_wait;
        loop {
            let admission = {
                let mut buckets = self.buckets.write().await;
                match buckets.get_mut(retailer_id) {
                    Some(bucket) => bucket.try_acquire_at(Instant::now()),
                    None => Admission::Proceed,
                }
            };

            match admission {
                Admission::Proceed => return AdmitOutcome::Admitted,
                Admission::WaitFor(wait) => {
                    let now = Instant::now();
                    if now + wait > deadline {
                        debug!(
                            retailer = retailer_id,
                            ?wait,
                            "admission wait exceeds cap, deferring task"
                        );
                        return AdmitOutcome::Deferred(wait);
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

}
