//! Retry backoff policy.
//!
//! A pure computation from (attempts, failure kind) to the delay before
//! the next attempt, kept free of I/O so it is independently testable.

use std::time::Duration;

use crate::scrapers::FailureKind;

/// Delay never grows beyond this.
const MAX_DELAY: Duration = Duration::from_secs(3_600);

/// Compute the delay before retrying a task that has failed `attempts`
/// times, the most recent time with `kind`.
///
/// Rate limiting backs off far longer than transient network trouble;
/// extraction failures wait longest since a changed page layout will not
/// fix itself within seconds.
pub fn retry_delay(attempts: u32, kind: FailureKind) -> Duration {
    let base = match kind {
        FailureKind::RateLimited => Duration::from_secs(300),
        FailureKind::NetworkTimeout | FailureKind::NetworkError => Duration::from_secs(30),
        FailureKind::BlockedOrChallenged => Duration::from_secs(120),
        FailureKind::ExtractionFailure => Duration::from_secs(600),
    };
    // Exponential in the attempt count, capped to keep the shift in u32
    // range and the delay bounded.
    let factor = 1u32 << attempts.min(6);
    base.saturating_mul(factor).min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially() {
        let first = retry_delay(0, FailureKind::NetworkError);
        let second = retry_delay(1, FailureKind::NetworkError);
        let third = retry_delay(2, FailureKind::NetworkError);
        assert_eq!(second, first * 2);
        assert_eq!(third, first * 4);
    }

    #[test]
    fn rate_limited_backs_off_longer_than_transient() {
        assert!(retry_delay(0, FailureKind::RateLimited) > retry_delay(0, FailureKind::NetworkTimeout));
    }

    #[test]
    fn delay_is_capped() {
        assert_eq!(retry_delay(30, FailureKind::ExtractionFailure), MAX_DELAY);
        assert_eq!(retry_delay(u32::MAX, FailureKind::RateLimited), MAX_DELAY);
    }
}
