//! Scrape worker loop.
//!
//! Each worker repeatedly claims the best dispatchable task, passes the
//! rate governor, fetches through a rotated identity and routes the result
//! through validation into the store. Workers hold no state of their own;
//! everything shared lives in `WorkerContext`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::health::CircuitBreaker;
use super::queue::{ClaimedTask, TaskQueue};
use crate::identity::IdentityRotator;
use crate::models::{PriceObservation, ProductListing, Verdict};
use crate::notify::{AlertSink, PriceDropEvent};
use crate::rate_limit::{AdmitOutcome, RateGovernor};
use crate::repository::EngineStore;
use crate::scrapers::{FailureKind, FetchError, FetcherRegistry};
use crate::validator::{PriceValidator, ValidationContext};

/// How long an idle worker sleeps before polling the queue again.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// History depth fetched for validation.
const HISTORY_DEPTH: u32 = 10;

/// Shared dependencies of every worker.
pub struct WorkerContext {
    pub queue: Arc<TaskQueue>,
    pub governor: Arc<RateGovernor>,
    pub rotator: Arc<IdentityRotator>,
    pub breaker: Arc<CircuitBreaker>,
    pub registry: Arc<FetcherRegistry>,
    pub store: Arc<dyn EngineStore>,
    pub validator: PriceValidator,
    pub alerts: Arc<dyn AlertSink>,
    pub task_timeout: Duration,
}

/// Run one worker until shutdown is signalled. In-flight work finishes;
/// nothing new is claimed afterward.
pub async fn run_worker(id: usize, ctx: Arc<WorkerContext>, mut shutdown: watch::Receiver<bool>) {
    debug!(worker = id, "worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let breaker = ctx.breaker.clone();
        let claimed = ctx
            .queue
            .claim(Utc::now(), &|retailer| breaker.allows(retailer));

        match claimed {
            Some(claimed) => process_task(&ctx, claimed).await,
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
    debug!(worker = id, "worker stopped");
}

/// Execute one claimed task end to end.
pub async fn process_task(ctx: &WorkerContext, claimed: ClaimedTask) {
    let task = &claimed.task;
    // Admission first: a claim is not a request yet.
    match ctx.governor.admit(&task.retailer_id).await {
        AdmitOutcome::Admitted => {}
        AdmitOutcome::Deferred(wait) => {
            debug!(task = %task.id, retailer = %task.retailer_id, ?wait, "deferring task");
            ctx.queue.defer(&claimed, wait, Utc::now());
            return;
        }
    }

    let Some(fetcher) = ctx.registry.get(&task.retailer_id) else {
        ctx.queue.skip(&claimed, "no fetcher registered for retailer");
        return;
    };

    let listing = match ctx.store.get_listing(task.listing_id).await {
        Ok(Some(listing)) if listing.active => listing,
        Ok(_) => {
            ctx.queue.skip(&claimed, "listing missing or inactive");
            return;
        }
        Err(err) => {
            error!(task = %task.id, error = %err, "loading listing failed");
            ctx.queue.complete_failure(
                &claimed,
                FailureKind::NetworkError,
                &err.to_string(),
                Utc::now(),
            );
            return;
        }
    };

    let identity = ctx.rotator.next(&task.retailer_id);

    // The fetcher applies the deadline itself; the outer timeout only
    // catches a misbehaving implementation.
    let fetched = match tokio::time::timeout(
        ctx.task_timeout + Duration::from_secs(5),
        fetcher.fetch(&listing.url, &identity, ctx.task_timeout),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(FetchError::new(
            FailureKind::NetworkTimeout,
            "fetch exceeded the task deadline",
        )),
    };

    match fetched {
        Ok(reading) => {
            ctx.breaker.record(&task.retailer_id, true);
            ctx.rotator.report_success(&task.retailer_id, identity.slot);

            let mut observation = PriceObservation::new(
                listing.id,
                reading.price,
                listing.last_known_price,
                reading.stock,
                task.source,
            );

            match assess(ctx, &listing, observation.price).await {
                Ok(assessment) => {
                    observation.verdict = assessment.verdict;
                    observation.confidence = assessment.confidence;
                    if let Some(reason) = &assessment.reason {
                        info!(
                            listing = %listing.id,
                            price = observation.price,
                            verdict = observation.verdict.as_str(),
                            reason,
                            "observation flagged"
                        );
                    }
                }
                Err(err) => {
                    // The price was fetched; a store error here counts as
                    // a failed attempt so the reading is not lost silently.
                    error!(task = %task.id, error = %err, "validation context load failed");
                    ctx.queue.complete_failure(
                        &claimed,
                        FailureKind::NetworkError,
                        &err.to_string(),
                        Utc::now(),
                    );
                    return;
                }
            }

            if let Err(err) = ctx.store.record_observation(&observation).await {
                error!(task = %task.id, error = %err, "persisting observation failed");
                ctx.queue.complete_failure(
                    &claimed,
                    FailureKind::NetworkError,
                    &err.to_string(),
                    Utc::now(),
                );
                return;
            }

            maybe_alert(ctx, &listing, &observation);
            ctx.queue.complete_success(&claimed);
            debug!(
                task = %task.id,
                listing = %listing.id,
                price = observation.price,
                verdict = observation.verdict.as_str(),
                "scrape succeeded"
            );
        }
        Err(err) => {
            ctx.breaker.record(&task.retailer_id, false);
            if err.kind.blames_identity() {
                ctx.rotator.report_failure(&task.retailer_id, identity.slot);
            }
            if let Some(snippet) = &err.snippet {
                warn!(task = %task.id, snippet, "extraction failure snippet");
            }
            if let Err(store_err) = ctx.store.record_listing_failure(listing.id).await {
                error!(listing = %listing.id, error = %store_err, "recording listing failure failed");
            }
            ctx.queue
                .complete_failure(&claimed, err.kind, &err.message, Utc::now());
        }
    }
}

/// Assemble the validation context from the store and assess the price.
async fn assess(
    ctx: &WorkerContext,
    listing: &ProductListing,
    price: f64,
) -> crate::repository::Result<crate::validator::Assessment> {
    let history = ctx.store.load_observations(listing.id, HISTORY_DEPTH).await?;
    let sibling_prices = ctx.store.sibling_prices(&listing.variant, listing.id).await?;
    let rule = ctx
        .store
        .load_validation_rules(listing.category.as_deref())
        .await?;

    Ok(ctx.validator.assess(
        price,
        Utc::now(),
        &ValidationContext {
            listing,
            history: &history,
            sibling_prices: &sibling_prices,
            rule: &rule,
        },
    ))
}

/// Emit a price-drop event when a valid observation lowers the price.
fn maybe_alert(ctx: &WorkerContext, listing: &ProductListing, observation: &PriceObservation) {
    if observation.verdict != Verdict::Valid {
        return;
    }
    let (Some(previous), Some(change_percent)) =
        (observation.previous_price, observation.change_percent)
    else {
        return;
    };
    if observation.price >= previous {
        return;
    }
    ctx.alerts.notify(PriceDropEvent {
        listing_id: listing.id,
        variant: listing.variant.clone(),
        retailer_id: listing.retailer_id.clone(),
        url: listing.url.clone(),
        old_price: previous,
        new_price: observation.price,
        change_percent,
        confidence: observation.confidence,
        observed_at: observation.recorded_at,
    });
}
