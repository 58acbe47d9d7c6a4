//! Sliding-window request accounting for one retailer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3_600);

/// Limits enforced for a retailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetailerLimits {
    pub per_minute: u32,
    pub per_hour: u32,
    pub min_spacing: Duration,
}

/// Result of a single admission probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    WaitFor(Duration),
}

/// Request history for one retailer. Uses true sliding windows rather
/// than refill counters so no 60-second window can ever exceed the
/// per-minute limit, even across bursts.
#[derive(Debug)]
pub struct RetailerBucket {
    limits: RetailerLimits,
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
    last_request: Option<Instant>,
}

impl RetailerBucket {
    pub fn new(limits: RetailerLimits) -> Self {
        Self {
            limits,
            minute: VecDeque::new(),
            hour: VecDeque::new(),
            last_request: None,
        }
    }

    pub fn set_limits(&mut self, limits: RetailerLimits) {
        self.limits = limits;
    }

    /// Attempt to consume a token at `now`. On success the request is
    /// recorded in both windows; on refusal the returned wait is the
    /// earliest time another probe could succeed.
    pub fn try_acquire_at(&mut self, now: Instant) -> Admission {
        self.evict(now);
        let wait = self.required_wait(now);
        if wait > Duration::ZERO {
            return Admission::WaitFor(wait);
        }

        self.minute.push_back(now);
        self.hour.push_back(now);
        self.last_request = Some(now);
        Admission::Proceed
    }

    fn required_wait(&self, now: Instant) -> Duration {
        let mut wait = Duration::ZERO;

        if let Some(last) = self.last_request {
            let since = now.saturating_duration_since(last);
            if since < self.limits.min_spacing {
                wait = wait.max(self.limits.min_spacing - since);
            }
        }

        wait = wait.max(Self::window_wait(
            &self.minute,
            self.limits.per_minute,
            MINUTE,
            now,
        ));
        wait = wait.max(Self::window_wait(&self.hour, self.limits.per_hour, HOUR, now));
        wait
    }

    /// Wait until the oldest in-window request ages out, if the window is
    /// full. Expired entries are skipped rather than drained so the probe
    /// can stay `&self`; acquisition evicts below.
    fn window_wait(window: &VecDeque<Instant>, limit: u32, span: Duration, now: Instant) -> Duration {
        let cutoff = now.checked_sub(span);
        let live = match cutoff {
            Some(cutoff) => window.iter().filter(|&&t| t > cutoff).count(),
            None => window.len(),
        };
        if (live as u32) < limit {
            return Duration::ZERO;
        }
        // Window full: the first live entry leaving the window frees a slot.
        let oldest_live = match cutoff {
            Some(cutoff) => window.iter().find(|&&t| t > cutoff).copied(),
            None => window.front().copied(),
        };
        match oldest_live {
            Some(oldest) => span.saturating_sub(now.saturating_duration_since(oldest)),
            None => Duration::ZERO,
        }
    }

    /// Drop entries that have aged out of both windows. Bounds memory;
    /// correctness never depends on it since probes filter by cutoff.
    fn evict(&mut self, now: Instant) {
        if let Some(cutoff) = now.checked_sub(MINUTE) {
            while self.minute.front().is_some_and(|&t| t <= cutoff) {
                self.minute.pop_front();
            }
        }
        if let Some(cutoff) = now.checked_sub(HOUR) {
            while self.hour.front().is_some_and(|&t| t <= cutoff) {
                self.hour.pop_front();
            }
        }
    }
}
