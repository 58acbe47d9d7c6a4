//! End-to-end engine behavior against an in-memory store and scripted
//! fetchers: dispatch, validation routing, alerting, discovery.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;

use pricewatch::config::Config;
use pricewatch::engine::{
    process_task, CircuitBreaker, Engine, ImmediateScrape, TaskQueue, WorkerContext,
};
use pricewatch::discovery::DiscoveryProcessor;
use pricewatch::identity::{Identity, IdentityRotator};
use pricewatch::models::{
    DiscoveryStatus, PriceObservation, ProductListing, ScrapeTask, StockStatus, TaskSource,
    TaskStatus, Verdict,
};
use pricewatch::notify::{AlertSink, ChannelSink, LogSink};
use pricewatch::rate_limit::RateGovernor;
use pricewatch::repository::{EngineStore, MemoryStore};
use pricewatch::scrapers::{
    Candidate, FailureKind, FetchError, FetchedPrice, FetcherRegistry, PriceFetcher,
};
use pricewatch::validator::PriceValidator;

/// Fetcher that replays a scripted sequence of fetch results.
struct ScriptedFetcher {
    fetches: Mutex<VecDeque<Result<FetchedPrice, FetchError>>>,
    search_results: Vec<Candidate>,
    search_failure: Option<FailureKind>,
}

impl ScriptedFetcher {
    fn fetching(results: Vec<Result<FetchedPrice, FetchError>>) -> Self {
        Self {
            fetches: Mutex::new(results.into()),
            search_results: Vec::new(),
            search_failure: None,
        }
    }

    fn searching(results: Vec<Candidate>) -> Self {
        Self {
            fetches: Mutex::new(VecDeque::new()),
            search_results: results,
            search_failure: None,
        }
    }

    fn broken_search(kind: FailureKind) -> Self {
        Self {
            fetches: Mutex::new(VecDeque::new()),
            search_results: Vec::new(),
            search_failure: Some(kind),
        }
    }
}

#[async_trait]
impl PriceFetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        _url: &str,
        _identity: &Identity,
        _timeout: Duration,
    ) -> Result<FetchedPrice, FetchError> {
        self.fetches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(FetchError::new(FailureKind::NetworkError, "script exhausted")))
    }

    async fn search(
        &self,
        _query: &str,
        _identity: &Identity,
        _timeout: Duration,
    ) -> Result<Vec<Candidate>, FetchError> {
        match self.search_failure {
            Some(kind) => Err(FetchError::new(kind, "scripted search failure")),
            None => Ok(self.search_results.clone()),
        }
    }
}

fn price(value: f64) -> Result<FetchedPrice, FetchError> {
    Ok(FetchedPrice {
        price: value,
        stock: StockStatus::InStock,
        title: None,
    })
}

/// Worker context with permissive governor and default components.
fn context(
    store: Arc<MemoryStore>,
    registry: FetcherRegistry,
    alerts: Arc<dyn AlertSink>,
) -> (Arc<WorkerContext>, Arc<TaskQueue>) {
    let queue = Arc::new(TaskQueue::new(Duration::from_secs(120)));
    let ctx = Arc::new(WorkerContext {
        queue: queue.clone(),
        governor: Arc::new(RateGovernor::new(Duration::from_secs(5))),
        rotator: Arc::new(IdentityRotator::new(Duration::from_secs(60))),
        breaker: Arc::new(CircuitBreaker::new(Duration::from_secs(60))),
        registry: Arc::new(registry),
        store,
        validator: PriceValidator::new(),
        alerts,
        task_timeout: Duration::from_secs(5),
    });
    (ctx, queue)
}

async fn seeded_listing(store: &MemoryStore, last_price: Option<f64>) -> ProductListing {
    let mut listing = ProductListing::new("whey-isolate-1kg", "shop", "https://shop.example/p/1");
    listing.last_known_price = last_price;
    store.save_listing(&listing).await.unwrap();
    if let Some(previous) = last_price {
        // Give the rolling average something to stand on.
        let seed = PriceObservation::new(
            listing.id,
            previous,
            None,
            StockStatus::InStock,
            TaskSource::Scheduled,
        );
        store.record_observation(&seed).await.unwrap();
    }
    store.get_listing(listing.id).await.unwrap().unwrap()
}

fn task_for(listing: &ProductListing) -> ScrapeTask {
    ScrapeTask::new(
        listing.id,
        &listing.retailer_id,
        5,
        TaskSource::Scheduled,
        Utc::now(),
        3,
    )
}

#[tokio::test]
async fn valid_observation_updates_price() {
    let store = Arc::new(MemoryStore::new());
    let listing = seeded_listing(&store, Some(3_500.0)).await;

    let mut registry = FetcherRegistry::new();
    registry.register("shop", Arc::new(ScriptedFetcher::fetching(vec![price(3_400.0)])));
    let (ctx, queue) = context(store.clone(), registry, Arc::new(LogSink));

    queue.enqueue(task_for(&listing));
    let claimed = queue.claim(Utc::now(), &|_| true).unwrap();
    process_task(&ctx, claimed).await;

    let listing = store.get_listing(listing.id).await.unwrap().unwrap();
    assert_eq!(listing.last_known_price, Some(3_400.0));
    let history = store.load_observations(listing.id, 10).await.unwrap();
    assert_eq!(history[0].verdict, Verdict::Valid);
    assert_eq!(history[0].price, 3_400.0);
}

#[tokio::test]
async fn out_of_band_price_is_rejected_but_kept_for_audit() {
    let store = Arc::new(MemoryStore::new());
    let listing = seeded_listing(&store, Some(3_500.0)).await;

    // 100x the rolling average: far outside the 10x ceiling.
    let mut registry = FetcherRegistry::new();
    registry.register(
        "shop",
        Arc::new(ScriptedFetcher::fetching(vec![price(350_000.0)])),
    );
    let (ctx, queue) = context(store.clone(), registry, Arc::new(LogSink));

    queue.enqueue(task_for(&listing));
    let claimed = queue.claim(Utc::now(), &|_| true).unwrap();
    process_task(&ctx, claimed).await;

    let listing = store.get_listing(listing.id).await.unwrap().unwrap();
    assert_eq!(listing.last_known_price, Some(3_500.0));
    let history = store.load_observations(listing.id, 10).await.unwrap();
    assert_eq!(history[0].verdict, Verdict::Rejected);
    // The reading itself is still on record.
    assert_eq!(history[0].price, 350_000.0);
}

#[tokio::test]
async fn price_drop_emits_alert() {
    let store = Arc::new(MemoryStore::new());
    let listing = seeded_listing(&store, Some(3_500.0)).await;

    let mut registry = FetcherRegistry::new();
    registry.register("shop", Arc::new(ScriptedFetcher::fetching(vec![price(2_999.0)])));
    let (sink, mut alerts_rx) = ChannelSink::new();
    let (ctx, queue) = context(store.clone(), registry, Arc::new(sink));

    queue.enqueue(task_for(&listing));
    let claimed = queue.claim(Utc::now(), &|_| true).unwrap();
    process_task(&ctx, claimed).await;

    let event = alerts_rx.try_recv().unwrap();
    assert_eq!(event.listing_id, listing.id);
    assert_eq!(event.old_price, 3_500.0);
    assert_eq!(event.new_price, 2_999.0);
    assert!(event.change_percent < 0.0);
}

#[tokio::test]
async fn blocked_fetch_schedules_retry_and_counts_failure() {
    let store = Arc::new(MemoryStore::new());
    let listing = seeded_listing(&store, Some(3_500.0)).await;

    let mut registry = FetcherRegistry::new();
    registry.register(
        "shop",
        Arc::new(ScriptedFetcher::fetching(vec![Err(FetchError::new(
            FailureKind::BlockedOrChallenged,
            "challenge page",
        ))])),
    );
    let (ctx, queue) = context(store.clone(), registry, Arc::new(LogSink));

    let task_id = queue.enqueue(task_for(&listing));
    let claimed = queue.claim(Utc::now(), &|_| true).unwrap();
    process_task(&ctx, claimed).await;

    let task = queue.get(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.source, TaskSource::Retry);

    let listing = store.get_listing(listing.id).await.unwrap().unwrap();
    assert_eq!(listing.consecutive_failures, 1);
    // No observation was recorded for the failed fetch.
    assert_eq!(store.load_observations(listing.id, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn discovery_registers_dedupes_and_isolates_retailer_errors() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());

    let mut registry = FetcherRegistry::new();
    registry.register(
        "good-shop",
        Arc::new(ScriptedFetcher::searching(vec![
            Candidate {
                title: "Whey Isolate 1kg Chocolate".into(),
                url: "https://good.example/p/42".into(),
                sku: Some("SKU-42".into()),
                price: Some(3_200.0),
            },
            // Same product listed twice in the results page.
            Candidate {
                title: "Whey Isolate 1kg Chocolate".into(),
                url: "https://good.example/p/42".into(),
                sku: Some("SKU-42".into()),
                price: Some(3_200.0),
            },
        ])),
    );
    registry.register(
        "broken-shop",
        Arc::new(ScriptedFetcher::broken_search(FailureKind::NetworkTimeout)),
    );

    let queue = Arc::new(TaskQueue::new(Duration::from_secs(120)));
    let processor = DiscoveryProcessor {
        store: store.clone(),
        registry: Arc::new(registry),
        governor: Arc::new(RateGovernor::new(Duration::from_secs(5))),
        rotator: Arc::new(IdentityRotator::new(Duration::from_secs(60))),
        breaker: Arc::new(CircuitBreaker::new(Duration::from_secs(60))),
        queue: queue.clone(),
        search_timeout: Duration::from_secs(5),
        max_attempts: 3,
    };

    let request = pricewatch::models::DiscoveryRequest::new(
        "whey isolate",
        vec!["good-shop".into(), "broken-shop".into()],
        None,
    );
    let request_id = request.id;
    processor.process(request).await;

    let request = store.get_discovery_request(request_id).await.unwrap().unwrap();
    // One retailer failing does not fail the request.
    assert_eq!(request.status, DiscoveryStatus::Completed);
    assert_eq!(request.listing_ids.len(), 1);
    assert_eq!(request.errors.len(), 1);
    assert_eq!(request.errors[0].retailer_id, "broken-shop");

    let listings = store.load_active_listings(Some("good-shop")).await.unwrap();
    assert_eq!(listings.len(), 1);
    assert_eq!(listings[0].variant, "whey-isolate-1kg-chocolate");
    assert_eq!(listings[0].sku.as_deref(), Some("SKU-42"));

    // The new listing got an initial scrape task; the duplicate did not.
    assert_eq!(queue.depth(), 1);

    // Running the same search again matches instead of re-registering.
    let rerun = pricewatch::models::DiscoveryRequest::new(
        "whey isolate",
        vec!["good-shop".into()],
        None,
    );
    processor.process(rerun).await;
    let listings = store.load_active_listings(Some("good-shop")).await.unwrap();
    assert_eq!(listings.len(), 1);
}

#[tokio::test]
async fn immediate_scrape_reports_unavailable_and_keeps_the_task_queued() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let listing = seeded_listing(&store, Some(3_500.0)).await;

    let mut registry = FetcherRegistry::new();
    registry.register("shop", Arc::new(ScriptedFetcher::fetching(Vec::new())));

    let engine = Engine::new(
        Config::default(),
        None,
        store.clone(),
        Arc::new(registry),
        Arc::new(LogSink),
    )
    .await
    .unwrap();

    // No workers are running, so the wait must elapse unserviced.
    let outcome = engine
        .submit_immediate_scrape(listing.id, Duration::from_millis(300))
        .await
        .unwrap();

    match outcome {
        ImmediateScrape::Unavailable { task_id } => {
            // The task keeps its queue position for when capacity frees up.
            let task = engine.queue().get(task_id).unwrap();
            assert_eq!(task.status, TaskStatus::Pending);
            assert_eq!(task.source, TaskSource::UserRequest);
            assert_eq!(task.priority, 9);
        }
        ImmediateScrape::Fresh(observation) => {
            panic!("no worker ran, yet got an observation: {observation:?}")
        }
    }

    // The listing's price is untouched.
    let listing = store.get_listing(listing.id).await.unwrap().unwrap();
    assert_eq!(listing.last_known_price, Some(3_500.0));
}

#[tokio::test]
async fn immediate_scrape_returns_fresh_observation() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let listing = seeded_listing(&store, Some(3_500.0)).await;

    let mut registry = FetcherRegistry::new();
    registry.register("shop", Arc::new(ScriptedFetcher::fetching(vec![price(3_450.0)])));

    let engine = Engine::new(
        Config::default(),
        None,
        store.clone(),
        Arc::new(registry),
        Arc::new(LogSink),
    )
    .await
    .unwrap();

    let (stop_tx, stop_rx) = watch::channel(false);
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(stop_rx).await })
    };

    let outcome = engine
        .submit_immediate_scrape(listing.id, Duration::from_secs(10))
        .await
        .unwrap();
    let _ = stop_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), runner).await;

    match outcome {
        ImmediateScrape::Fresh(observation) => {
            assert_eq!(observation.price, 3_450.0);
            assert_eq!(observation.verdict, Verdict::Valid);
            assert_eq!(observation.source, TaskSource::UserRequest);
        }
        ImmediateScrape::Unavailable { .. } => panic!("expected a fresh observation"),
    }

    let listing = store.get_listing(listing.id).await.unwrap().unwrap();
    assert_eq!(listing.last_known_price, Some(3_450.0));
}
