//! Identity rotation for outbound requests.
//!
//! Supplies a (proxy, user-agent) pair per request with per-slot health
//! tracking. Selection is weighted random, avoiding recently-failed slots;
//! a slot is demoted after consecutive attributed failures and promoted
//! back after a cooldown. Pure selection logic, no network calls.

mod user_agent;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

pub use user_agent::{random_user_agent, BROWSER_USER_AGENTS};

/// Consecutive attributed failures before a slot is demoted.
const DEMOTION_THRESHOLD: u32 = 3;

/// A concrete identity handed to the HTTP layer. `slot` attributes the
/// request outcome back to the rotator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub proxy: Option<String>,
    pub user_agent: String,
    pub slot: usize,
}

/// Health state for one (proxy, user-agent) slot.
///
/// Counters are atomics: readers tolerate slightly stale values, and
/// selection must never block a worker reporting an outcome.
#[derive(Debug)]
struct Slot {
    proxy: Option<String>,
    consecutive_failures: AtomicU32,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    /// Demotion expiry, as millis since rotator start. Zero = healthy.
    demoted_until_ms: AtomicU64,
}

impl Slot {
    fn new(proxy: Option<String>) -> Self {
        Self {
            proxy,
            consecutive_failures: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            demoted_until_ms: AtomicU64::new(0),
        }
    }

    fn is_demoted(&self, now_ms: u64) -> bool {
        self.demoted_until_ms.load(Ordering::Relaxed) > now_ms
    }

    /// Weight for random selection; decays with recent failures.
    fn weight(&self) -> f64 {
        1.0 / (1.0 + self.consecutive_failures.load(Ordering::Relaxed) as f64)
    }
}

/// Per-retailer identity pool.
#[derive(Debug)]
struct Pool {
    slots: Vec<Slot>,
}

/// Rotator shared by all workers.
#[derive(Debug)]
pub struct IdentityRotator {
    started: Instant,
    demotion_cooldown: Duration,
    /// Slot lists only change on config refresh; health lives in atomics.
    pools: RwLock<HashMap<String, Pool>>,
}

impl IdentityRotator {
    pub fn new(demotion_cooldown: Duration) -> Self {
        Self {
            started: Instant::now(),
            demotion_cooldown,
            pools: RwLock::new(HashMap::new()),
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Install the proxy list for a retailer. An empty list still yields
    /// one direct-connection slot so rotation degrades gracefully.
    pub fn configure(&self, retailer_id: &str, proxies: &[String]) {
        let mut slots: Vec<Slot> = proxies.iter().map(|p| Slot::new(Some(p.clone()))).collect();
        if slots.is_empty() {
            slots.push(Slot::new(None));
        }
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        pools.insert(retailer_id.to_string(), Pool { slots });
    }

    /// Pick an identity for the next request to this retailer.
    ///
    /// Demoted slots are skipped while any healthy slot exists; when every
    /// slot is demoted the least-bad one is used anyway, since refusing to
    /// scrape entirely is worse than reusing a flagged identity.
    pub fn next(&self, retailer_id: &str) -> Identity {
        let now_ms = self.now_ms();
        let pools = self.pools.read().unwrap_or_else(|e| e.into_inner());
        let pool = match pools.get(retailer_id) {
            Some(pool) => pool,
            None => {
                return Identity {
                    proxy: None,
                    user_agent: random_user_agent().to_string(),
                    slot: 0,
                }
            }
        };

        let healthy: Vec<usize> = (0..pool.slots.len())
            .filter(|&i| !pool.slots[i].is_demoted(now_ms))
            .collect();

        let slot = if healthy.is_empty() {
            // All demoted: fall back to the slot closest to promotion.
            (0..pool.slots.len())
                .min_by_key(|&i| pool.slots[i].demoted_until_ms.load(Ordering::Relaxed))
                .unwrap_or(0)
        } else {
            weighted_pick(&healthy, |i| pool.slots[i].weight())
        };

        pool.slots[slot].total_requests.fetch_add(1, Ordering::Relaxed);
        Identity {
            proxy: pool.slots[slot].proxy.clone(),
            user_agent: random_user_agent().to_string(),
            slot,
        }
    }

    /// Clear failure streak for the slot that served a successful request.
    pub fn report_success(&self, retailer_id: &str, slot: usize) {
        let pools = self.pools.read().unwrap_or_else(|e| e.into_inner());
        if let Some(s) = pools.get(retailer_id).and_then(|p| p.slots.get(slot)) {
            s.consecutive_failures.store(0, Ordering::Relaxed);
        }
    }

    /// Record a failure attributed to the identity (blocked page, challenge,
    /// proxy-level network error). Demotes after the threshold.
    pub fn report_failure(&self, retailer_id: &str, slot: usize) {
        let now_ms = self.now_ms();
        let pools = self.pools.read().unwrap_or_else(|e| e.into_inner());
        let Some(s) = pools.get(retailer_id).and_then(|p| p.slots.get(slot)) else {
            return;
        };

        s.total_failures.fetch_add(1, Ordering::Relaxed);
        let streak = s.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if streak >= DEMOTION_THRESHOLD && !s.is_demoted(now_ms) {
            let until = now_ms + self.demotion_cooldown.as_millis() as u64;
            s.demoted_until_ms.store(until, Ordering::Relaxed);
            // Streak resets so the slot re-earns trust after cooldown.
            s.consecutive_failures.store(0, Ordering::Relaxed);
            warn!(
                retailer = retailer_id,
                slot,
                cooldown = ?self.demotion_cooldown,
                "identity demoted after repeated failures"
            );
        } else {
            debug!(retailer = retailer_id, slot, streak, "identity failure recorded");
        }
    }
}

/// Weighted random pick over candidate indices.
fn weighted_pick(candidates: &[usize], weight: impl Fn(usize) -> f64) -> usize {
    let total: f64 = candidates.iter().map(|&i| weight(i)).sum();
    if total <= 0.0 {
        return candidates[0];
    }
    let mut roll = rand::rng().random_range(0.0..total);
    for &i in candidates {
        let w = weight(i);
        if roll < w {
            return i;
        }
        roll -= w;
    }
    candidates[candidates.len() - 1]
}
