//! Engine orchestration.
//!
//! Owns the task queue, the worker pool and the periodic loops (lease
//! reaper, refresh planner, config refresh), and exposes the operations
//! the CLI and embedders call: discovery, immediate scrape, health.

mod backoff;
mod health;
mod queue;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use backoff::retry_delay;
pub use health::{BreakerState, CircuitBreaker, EngineHealth, RetailerHealth};
pub use queue::{ClaimedTask, Disposition, TaskQueue};
pub use worker::{process_task, run_worker, WorkerContext};

use crate::config::{reload_if_changed, Config, EngineSettings};
use crate::discovery::DiscoveryProcessor;
use crate::identity::IdentityRotator;
use crate::models::{
    DiscoveryRequest, PriceObservation, ScrapeTask, TaskSource, TaskStatus,
};
use crate::notify::AlertSink;
use crate::rate_limit::RateGovernor;
use crate::repository::EngineStore;
use crate::scrapers::{FetcherRegistry, SelectorFetcher};
use crate::validator::PriceValidator;

/// How often the refresh planner scans listings.
const PLAN_INTERVAL: Duration = Duration::from_secs(60);

/// Terminal tasks older than this are dropped from the queue arena.
const TASK_RETENTION_HOURS: i64 = 24;

/// Priority of an immediate user-requested scrape. Above everything the
/// planner or discovery enqueues.
const IMMEDIATE_PRIORITY: u8 = 9;

/// Outcome of an immediate scrape request.
#[derive(Debug, Clone, PartialEq)]
pub enum ImmediateScrape {
    /// The scrape finished and produced this observation.
    Fresh(PriceObservation),
    /// The scrape could not finish within the wait; the task keeps its
    /// place in the queue and the caller should retry later.
    Unavailable { task_id: Uuid },
}

/// The assembled engine. Construct once, share via `Arc`.
pub struct Engine {
    settings: EngineSettings,
    config_path: Option<PathBuf>,
    current: RwLock<Config>,
    queue: Arc<TaskQueue>,
    governor: Arc<RateGovernor>,
    rotator: Arc<IdentityRotator>,
    breaker: Arc<CircuitBreaker>,
    registry: Arc<FetcherRegistry>,
    store: Arc<dyn EngineStore>,
    alerts: Arc<dyn AlertSink>,
}

impl Engine {
    /// Assemble an engine from configuration and apply it.
    pub async fn new(
        config: Config,
        config_path: Option<PathBuf>,
        store: Arc<dyn EngineStore>,
        registry: Arc<FetcherRegistry>,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Arc<Self>> {
        let settings = config.engine.clone();
        let engine = Arc::new(Self {
            queue: Arc::new(TaskQueue::new(settings.lease())),
            governor: Arc::new(RateGovernor::new(settings.max_admission_wait())),
            rotator: Arc::new(IdentityRotator::new(settings.demotion_cooldown())),
            breaker: Arc::new(CircuitBreaker::new(settings.breaker_cooldown())),
            registry,
            store,
            alerts,
            current: RwLock::new(Config::default()),
            config_path,
            settings,
        });
        engine.apply_config(config).await?;
        Ok(engine)
    }

    /// Build the selector-driven fetchers a config describes.
    pub fn build_registry(config: &Config) -> Result<FetcherRegistry> {
        let mut registry = FetcherRegistry::new();
        for rc in &config.retailers {
            let fetcher = SelectorFetcher::new(&rc.retailer.id, rc.selectors.clone())?;
            registry.register(&rc.retailer.id, Arc::new(fetcher));
        }
        Ok(registry)
    }

    /// Push (re)loaded retailers and rules into the live components.
    pub async fn apply_config(&self, config: Config) -> Result<()> {
        let retailers = config.retailers();
        self.governor.configure(&retailers).await;
        for rc in &config.retailers {
            let proxies = if rc.retailer.rotate_identity {
                rc.proxies.clone()
            } else {
                Vec::new()
            };
            self.rotator.configure(&rc.retailer.id, &proxies);
            self.breaker
                .configure(&rc.retailer.id, rc.retailer.failure_rate_tolerance);
        }
        self.store.replace_validation_rules(&config.rules).await?;
        *self.current.write().await = config;
        Ok(())
    }

    pub fn store(&self) -> Arc<dyn EngineStore> {
        self.store.clone()
    }

    pub fn queue(&self) -> Arc<TaskQueue> {
        self.queue.clone()
    }

    /// Submit a user search. Returns the request id immediately; the
    /// request runs in the background and its result snapshot lands in
    /// the store.
    pub async fn submit_discovery_request(
        self: &Arc<Self>,
        query: &str,
        retailers: Vec<String>,
        requester: Option<String>,
    ) -> Result<Uuid> {
        let retailers = if retailers.is_empty() {
            self.registry.retailer_ids()
        } else {
            retailers
        };
        let request = DiscoveryRequest::new(query, retailers, requester);
        let id = request.id;
        self.store.save_discovery_request(&request).await?;

        let processor = self.discovery_processor();
        tokio::spawn(async move { processor.process(request).await });
        Ok(id)
    }

    /// Run one request inline instead of in the background. Used by the
    /// one-shot CLI path.
    pub async fn run_discovery_blocking(
        self: &Arc<Self>,
        query: &str,
        retailers: Vec<String>,
        requester: Option<String>,
    ) -> Result<DiscoveryRequest> {
        let retailers = if retailers.is_empty() {
            self.registry.retailer_ids()
        } else {
            retailers
        };
        let request = DiscoveryRequest::new(query, retailers, requester);
        let id = request.id;
        self.store.save_discovery_request(&request).await?;
        self.discovery_processor().process(request).await;
        Ok(self
            .store
            .get_discovery_request(id)
            .await?
            .unwrap_or_else(|| DiscoveryRequest::new(query, Vec::new(), None)))
    }

    fn discovery_processor(&self) -> DiscoveryProcessor {
        DiscoveryProcessor {
            store: self.store.clone(),
            registry: self.registry.clone(),
            governor: self.governor.clone(),
            rotator: self.rotator.clone(),
            breaker: self.breaker.clone(),
            queue: self.queue.clone(),
            search_timeout: self.settings.task_timeout(),
            max_attempts: self.settings.max_attempts,
        }
    }

    /// Request a fresh scrape of one listing ahead of its schedule and
    /// wait up to `max_wait` for the result.
    ///
    /// The task competes through the same queue, governor and breaker as
    /// everything else; when it cannot finish in time the caller gets
    /// `Unavailable` and the task stays queued.
    pub async fn submit_immediate_scrape(
        self: &Arc<Self>,
        listing_id: Uuid,
        max_wait: Duration,
    ) -> Result<ImmediateScrape> {
        let listing = self
            .store
            .get_listing(listing_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown listing {listing_id}"))?;
        anyhow::ensure!(listing.active, "listing {listing_id} is inactive");

        let task_id = self.queue.enqueue(ScrapeTask::new(
            listing_id,
            &listing.retailer_id,
            IMMEDIATE_PRIORITY,
            TaskSource::UserRequest,
            Utc::now(),
            self.settings.max_attempts,
        ));

        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            match self.queue.get(task_id).map(|t| t.status) {
                Some(TaskStatus::Succeeded) => {
                    let mut history = self.store.load_observations(listing_id, 1).await?;
                    match history.pop() {
                        Some(observation) => return Ok(ImmediateScrape::Fresh(observation)),
                        None => return Ok(ImmediateScrape::Unavailable { task_id }),
                    }
                }
                Some(TaskStatus::Failed) | Some(TaskStatus::Skipped) | None => {
                    return Ok(ImmediateScrape::Unavailable { task_id });
                }
                Some(TaskStatus::Pending) | Some(TaskStatus::InProgress) => {
                    if tokio::time::Instant::now() >= deadline {
                        debug!(task = %task_id, "immediate scrape wait elapsed");
                        return Ok(ImmediateScrape::Unavailable { task_id });
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }

    /// Queue depth plus per-retailer success rates and breaker states.
    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            queue_depth: self.queue.depth(),
            retailers: self.breaker.snapshot(),
        }
    }

    /// Run workers and maintenance loops until shutdown is signalled,
    /// then drain.
    pub async fn run(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let ctx = Arc::new(WorkerContext {
            queue: self.queue.clone(),
            governor: self.governor.clone(),
            rotator: self.rotator.clone(),
            breaker: self.breaker.clone(),
            registry: self.registry.clone(),
            store: self.store.clone(),
            validator: PriceValidator::new(),
            alerts: self.alerts.clone(),
            task_timeout: self.settings.task_timeout(),
        });

        let mut tasks = JoinSet::new();
        for worker_id in 0..self.settings.workers.max(1) {
            tasks.spawn(run_worker(worker_id, ctx.clone(), shutdown.clone()));
        }
        tasks.spawn(maintenance_loop(self.clone(), shutdown.clone()));
        tasks.spawn(planner_loop(self.clone(), shutdown.clone()));
        if self.config_path.is_some() && self.settings.config_refresh_secs > 0 {
            tasks.spawn(config_refresh_loop(self.clone(), shutdown.clone()));
        }
        info!(workers = self.settings.workers.max(1), "engine running");

        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                warn!(error = %err, "engine task panicked");
            }
        }
        info!("engine stopped");
        Ok(())
    }

    /// One planner pass: enqueue refresh tasks for listings whose
    /// interval has elapsed.
    pub async fn plan_refreshes(&self) -> Result<usize> {
        let now = Utc::now();
        let retailers = self.current.read().await.retailers();
        let mut planned = 0;

        for retailer in retailers {
            let listings = self.store.load_active_listings(Some(&retailer.id)).await?;
            let interval = chrono::Duration::from_std(retailer.refresh_interval(now))
                .unwrap_or_else(|_| chrono::Duration::hours(6));
            for listing in listings {
                let due = match listing.last_scraped_at {
                    Some(at) => at + interval <= now,
                    None => true,
                };
                if !due || self.queue.has_open_task_for(listing.id) {
                    continue;
                }
                self.queue.enqueue(ScrapeTask::new(
                    listing.id,
                    &retailer.id,
                    retailer.refresh_priority(now),
                    TaskSource::Scheduled,
                    now,
                    self.settings.max_attempts,
                ));
                planned += 1;
            }
        }
        if planned > 0 {
            debug!(planned, "refresh tasks enqueued");
        }
        Ok(planned)
    }
}

/// Reap expired leases and prune old terminal tasks.
async fn maintenance_loop(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    let period = engine.settings.lease().max(Duration::from_secs(2)) / 2;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            return;
        }
        let now = Utc::now();
        let reaped = engine.queue.reap_expired(now);
        if !reaped.is_empty() {
            warn!(count = reaped.len(), "reaped expired task leases");
        }
        engine
            .queue
            .prune_terminal(now - chrono::Duration::hours(TASK_RETENTION_HOURS));
    }
}

async fn planner_loop(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if let Err(err) = engine.plan_refreshes().await {
            warn!(error = %err, "refresh planning failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(PLAN_INTERVAL) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            return;
        }
    }
}

/// Re-read the config file and apply retailer and rule changes live.
async fn config_refresh_loop(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    let path = engine.config_path.clone().expect("checked by caller");
    let period = Duration::from_secs(engine.settings.config_refresh_secs);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            return;
        }
        let current = engine.current.read().await.clone();
        if let Some(fresh) = reload_if_changed(&path, &current) {
            info!("configuration changed, applying");
            if let Err(err) = engine.apply_config(fresh).await {
                warn!(error = %err, "applying refreshed config failed");
            }
        }
    }
}
