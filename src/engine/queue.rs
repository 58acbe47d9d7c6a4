//! Scrape task queue.
//!
//! An arena of tasks indexed by id with explicit priority and schedule
//! indexes. All mutation goes through one synchronized accessor; the lock
//! is short-lived and never held across I/O. The queue - not the store -
//! enforces the engine's central invariant: at most one in-progress task
//! per listing.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::backoff::retry_delay;
use crate::models::{ScrapeTask, TaskSource, TaskStatus};
use crate::scrapers::FailureKind;

/// Reschedule ceiling, as a multiple of `max_attempts`. Bounds the total
/// lifetime of a task whose failures (rate limiting, deferrals, lease
/// reaps) do not count as attempts.
const RESCHEDULE_CEILING_FACTOR: u32 = 3;

/// What happened to a task after a failure was reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Re-queued for another attempt at the given time.
    Retrying(DateTime<Utc>),
    /// Terminal: attempts or reschedules exhausted.
    Exhausted,
    /// The reporting claim was no longer current (its lease was reaped
    /// and the task possibly re-claimed); nothing changed.
    Stale,
}

/// A claimed task plus the token that authorizes reporting its outcome.
/// After a lease reap the token goes stale and outcome reports through it
/// are ignored, so a resurrected worker cannot release the exclusion now
/// held by the re-claiming worker.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: ScrapeTask,
    claim: u64,
}

/// Key for the ready index: highest priority first, then earliest due,
/// then FIFO.
#[derive(Debug, PartialEq, Eq)]
struct ReadyKey {
    priority: u8,
    scheduled_for: DateTime<Utc>,
    seq: u64,
    task_id: Uuid,
    generation: u64,
}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.scheduled_for.cmp(&self.scheduled_for))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Key for the future index: earliest due first (wrapped in `Reverse`).
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ScheduledKey {
    scheduled_for: DateTime<Utc>,
    seq: u64,
    task_id: Uuid,
    generation: u64,
}

struct Lease {
    until: DateTime<Utc>,
    claim: u64,
}

struct Inner {
    tasks: HashMap<Uuid, ScrapeTask>,
    ready: BinaryHeap<ReadyKey>,
    scheduled: BinaryHeap<Reverse<ScheduledKey>>,
    in_flight_listings: HashSet<Uuid>,
    /// Task id -> current lease for in-progress tasks.
    leases: HashMap<Uuid, Lease>,
    /// Stale-key guard: heap entries referencing an older generation are
    /// discarded lazily at pop. The arena is authoritative.
    generations: HashMap<Uuid, u64>,
    seq: u64,
}

/// The central priority queue aggregating all scrape demand.
pub struct TaskQueue {
    inner: Mutex<Inner>,
    lease: chrono::Duration,
}

impl TaskQueue {
    pub fn new(lease: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: HashMap::new(),
                ready: BinaryHeap::new(),
                scheduled: BinaryHeap::new(),
                in_flight_listings: HashSet::new(),
                leases: HashMap::new(),
                generations: HashMap::new(),
                seq: 0,
            }),
            lease: chrono::Duration::from_std(lease)
                .unwrap_or_else(|_| chrono::Duration::seconds(120)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a task to the queue. Future-dated tasks stay invisible to
    /// dispatch until due.
    pub fn enqueue(&self, task: ScrapeTask) -> Uuid {
        let id = task.id;
        let mut inner = self.lock();
        let generation = inner.next_generation(id);
        inner.index(&task, generation);
        inner.tasks.insert(id, task);
        id
    }

    /// Claim the highest-priority, earliest-due task whose listing has no
    /// in-progress task and whose retailer `retailer_ready` accepts.
    /// Claiming is atomic: the task moves to in-progress exactly once and
    /// takes a lease.
    pub fn claim(
        &self,
        now: DateTime<Utc>,
        retailer_ready: &dyn Fn(&str) -> bool,
    ) -> Option<ClaimedTask> {
        let mut inner = self.lock();
        inner.promote_due(now);

        let mut passed_over = Vec::new();
        let mut claimed = None;

        while let Some(key) = inner.ready.pop() {
            if !inner.key_is_current(&key.task_id, key.generation) {
                continue;
            }
            let eligible = {
                let task = &inner.tasks[&key.task_id];
                !inner.in_flight_listings.contains(&task.listing_id)
                    && retailer_ready(&task.retailer_id)
            };
            if !eligible {
                passed_over.push(key);
                continue;
            }

            let lease_until = now + self.lease;
            inner.seq += 1;
            let claim = inner.seq;
            let task = inner.tasks.get_mut(&key.task_id).expect("checked above");
            task.status = TaskStatus::InProgress;
            let listing_id = task.listing_id;
            let snapshot = task.clone();
            inner.in_flight_listings.insert(listing_id);
            inner.leases.insert(
                key.task_id,
                Lease {
                    until: lease_until,
                    claim,
                },
            );
            claimed = Some(ClaimedTask {
                task: snapshot,
                claim,
            });
            break;
        }

        for key in passed_over {
            inner.ready.push(key);
        }
        claimed
    }

    /// Mark a claimed task as having finished successfully. Ignored when
    /// the claim went stale through a lease reap.
    pub fn complete_success(&self, claimed: &ClaimedTask) {
        let task_id = claimed.task.id;
        let mut inner = self.lock();
        if !inner.release_claim(task_id, claimed.claim) {
            debug!(task = %task_id, "stale success report ignored");
            return;
        }
        if let Some(task) = inner.tasks.get_mut(&task_id) {
            task.status = TaskStatus::Succeeded;
            task.last_error = None;
        }
    }

    /// Record a failed attempt and decide whether the task retries.
    ///
    /// Rate-limited failures do not count against `max_attempts` (the
    /// reschedule ceiling bounds them instead); every other kind does.
    pub fn complete_failure(
        &self,
        claimed: &ClaimedTask,
        kind: FailureKind,
        error: &str,
        now: DateTime<Utc>,
    ) -> Disposition {
        let task_id = claimed.task.id;
        let mut inner = self.lock();
        if !inner.release_claim(task_id, claimed.claim) {
            debug!(task = %task_id, "stale failure report ignored");
            return Disposition::Stale;
        }

        let ceiling = {
            let Some(task) = inner.tasks.get_mut(&task_id) else {
                return Disposition::Exhausted;
            };
            task.last_error = Some(format!("{}: {error}", kind.as_str()));
            if kind != FailureKind::RateLimited {
                task.attempts += 1;
            }
            task.max_attempts.saturating_mul(RESCHEDULE_CEILING_FACTOR)
        };

        let (attempts, exhausted) = {
            let task = &inner.tasks[&task_id];
            (
                task.attempts,
                task.attempts >= task.max_attempts || task.reschedules >= ceiling,
            )
        };
        if exhausted {
            let task = inner.tasks.get_mut(&task_id).expect("present");
            task.status = TaskStatus::Failed;
            warn!(
                task = %task_id,
                attempts = task.attempts,
                error,
                "task failed permanently"
            );
            return Disposition::Exhausted;
        }

        let next = now
            + chrono::Duration::from_std(retry_delay(attempts, kind))
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        inner.requeue(task_id, next, Some(TaskSource::Retry));
        debug!(task = %task_id, kind = kind.as_str(), retry_at = %next, "task will retry");
        Disposition::Retrying(next)
    }

    /// Return a claimed task to pending after the rate governor declined
    /// to admit it within the wait cap. Not an attempt.
    pub fn defer(&self, claimed: &ClaimedTask, delay: Duration, now: DateTime<Utc>) {
        let task_id = claimed.task.id;
        let mut inner = self.lock();
        if !inner.release_claim(task_id, claimed.claim) {
            return;
        }
        let ceiling = match inner.tasks.get(&task_id) {
            Some(task) => task.max_attempts.saturating_mul(RESCHEDULE_CEILING_FACTOR),
            None => return,
        };
        if inner.tasks[&task_id].reschedules >= ceiling {
            let task = inner.tasks.get_mut(&task_id).expect("present");
            task.status = TaskStatus::Skipped;
            task.last_error = Some("deferred past the reschedule ceiling".into());
            return;
        }
        let next = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
        inner.requeue(task_id, next, None);
    }

    /// Terminal skip, e.g. the listing went inactive before dispatch.
    pub fn skip(&self, claimed: &ClaimedTask, reason: &str) {
        let task_id = claimed.task.id;
        let mut inner = self.lock();
        if !inner.release_claim(task_id, claimed.claim) {
            return;
        }
        if let Some(task) = inner.tasks.get_mut(&task_id) {
            task.status = TaskStatus::Skipped;
            task.last_error = Some(reason.to_string());
        }
    }

    /// Return tasks whose lease expired to pending. Protects against
    /// worker death without double-processing in normal operation.
    pub fn reap_expired(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut inner = self.lock();
        let expired: Vec<Uuid> = inner
            .leases
            .iter()
            .filter(|(_, lease)| lease.until <= now)
            .map(|(&id, _)| id)
            .collect();

        for task_id in &expired {
            // The expired lease is by definition the current one.
            inner.release(*task_id);
            let ceiling = match inner.tasks.get(task_id) {
                Some(task) => task.max_attempts.saturating_mul(RESCHEDULE_CEILING_FACTOR),
                None => continue,
            };
            if inner.tasks[task_id].reschedules >= ceiling {
                let task = inner.tasks.get_mut(task_id).expect("present");
                task.status = TaskStatus::Failed;
                task.last_error = Some("lease expired past the reschedule ceiling".into());
            } else {
                warn!(task = %task_id, "lease expired, returning task to pending");
                inner.requeue(*task_id, now, None);
            }
        }
        expired
    }

    /// Drop terminal tasks finished long enough ago to be uninteresting.
    pub fn prune_terminal(&self, created_before: DateTime<Utc>) {
        let mut inner = self.lock();
        let stale: Vec<Uuid> = inner
            .tasks
            .iter()
            .filter(|(_, t)| t.status.is_terminal() && t.created_at < created_before)
            .map(|(&id, _)| id)
            .collect();
        for id in stale {
            inner.tasks.remove(&id);
            inner.generations.remove(&id);
        }
    }

    pub fn get(&self, task_id: Uuid) -> Option<ScrapeTask> {
        self.lock().tasks.get(&task_id).cloned()
    }

    /// Whether the listing already has a task that will run (or is
    /// running). Used by the refresh planner to avoid duplicates.
    pub fn has_open_task_for(&self, listing_id: Uuid) -> bool {
        self.lock()
            .tasks
            .values()
            .any(|t| t.listing_id == listing_id && !t.status.is_terminal())
    }

    /// Number of tasks waiting for dispatch.
    pub fn depth(&self) -> usize {
        self.lock()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }
}

impl Inner {
    fn next_generation(&mut self, task_id: Uuid) -> u64 {
        self.seq += 1;
        let generation = self.seq;
        self.generations.insert(task_id, generation);
        generation
    }

    fn key_is_current(&self, task_id: &Uuid, generation: u64) -> bool {
        self.generations.get(task_id) == Some(&generation)
            && self
                .tasks
                .get(task_id)
                .is_some_and(|t| t.status == TaskStatus::Pending)
    }

    /// Index a pending task into the ready or scheduled heap.
    fn index(&mut self, task: &ScrapeTask, generation: u64) {
        self.seq += 1;
        let seq = self.seq;
        if task.is_due(Utc::now()) {
            self.ready.push(ReadyKey {
                priority: task.priority,
                scheduled_for: task.scheduled_for,
                seq,
                task_id: task.id,
                generation,
            });
        } else {
            self.scheduled.push(Reverse(ScheduledKey {
                scheduled_for: task.scheduled_for,
                seq,
                task_id: task.id,
                generation,
            }));
        }
    }

    /// Move tasks whose time has come from the future index to the ready
    /// index.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(Reverse(key)) = self.scheduled.peek() {
            if key.scheduled_for > now {
                break;
            }
            let Reverse(key) = self.scheduled.pop().expect("peeked");
            if self.key_is_current(&key.task_id, key.generation) {
                self.ready.push(ReadyKey {
                    priority: self.tasks[&key.task_id].priority,
                    scheduled_for: key.scheduled_for,
                    seq: key.seq,
                    task_id: key.task_id,
                    generation: key.generation,
                });
            }
        }
    }

    /// Put a task back to pending at a new time, bumping its generation
    /// so stale heap keys die.
    fn requeue(&mut self, task_id: Uuid, at: DateTime<Utc>, source: Option<TaskSource>) {
        let generation = self.next_generation(task_id);
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        task.status = TaskStatus::Pending;
        task.scheduled_for = at;
        task.reschedules += 1;
        if let Some(source) = source {
            task.source = source;
        }
        let snapshot = task.clone();
        self.index(&snapshot, generation);
    }

    /// Drop the lease and per-listing exclusion for a claimed task,
    /// regardless of which claim holds it. Reaper use only.
    fn release(&mut self, task_id: Uuid) {
        self.leases.remove(&task_id);
        if let Some(task) = self.tasks.get(&task_id) {
            self.in_flight_listings.remove(&task.listing_id);
        }
    }

    /// Release only when `claim` still holds the lease. A stale claim
    /// (reaped, task possibly re-claimed since) must leave the current
    /// holder's lease and exclusion untouched.
    fn release_claim(&mut self, task_id: Uuid, claim: u64) -> bool {
        match self.leases.get(&task_id) {
            Some(lease) if lease.claim == claim => {
                self.release(task_id);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(priority: u8, listing_id: Uuid) -> ScrapeTask {
        ScrapeTask::new(
            listing_id,
            "shop",
            priority,
            TaskSource::Scheduled,
            Utc::now() - chrono::Duration::seconds(1),
            3,
        )
    }

    fn queue() -> TaskQueue {
        TaskQueue::new(Duration::from_secs(120))
    }

    fn always_ready(_: &str) -> bool {
        true
    }

    #[test]
    fn dispatch_order_is_priority_then_due_time() {
        let queue = queue();
        // Enqueue in an order unrelated to priority.
        for priority in [9, 3, 7] {
            queue.enqueue(task(priority, Uuid::new_v4()));
        }

        let order: Vec<u8> = std::iter::from_fn(|| {
            queue
                .claim(Utc::now(), &always_ready)
                .map(|c| c.task.priority)
        })
        .collect();
        assert_eq!(order, vec![9, 7, 3]);
    }

    #[test]
    fn equal_priority_dispatches_earliest_due_first() {
        let queue = queue();
        let now = Utc::now();
        let mut late = task(5, Uuid::new_v4());
        late.scheduled_for = now - chrono::Duration::seconds(10);
        let mut early = task(5, Uuid::new_v4());
        early.scheduled_for = now - chrono::Duration::seconds(60);

        queue.enqueue(late.clone());
        queue.enqueue(early.clone());

        let first = queue.claim(now, &always_ready).unwrap();
        assert_eq!(first.task.id, early.id);
    }

    #[test]
    fn future_tasks_are_invisible_until_due() {
        let queue = queue();
        let mut future = task(9, Uuid::new_v4());
        future.scheduled_for = Utc::now() + chrono::Duration::seconds(3_600);
        queue.enqueue(future.clone());
        queue.enqueue(task(2, Uuid::new_v4()));

        // The high-priority task is not due; the low-priority one runs.
        let claimed = queue.claim(Utc::now(), &always_ready).unwrap();
        assert_eq!(claimed.task.priority, 2);
        assert!(queue.claim(Utc::now(), &always_ready).is_none());

        // Once due, it dispatches.
        let later = Utc::now() + chrono::Duration::seconds(3_601);
        let claimed = queue.claim(later, &always_ready).unwrap();
        assert_eq!(claimed.task.id, future.id);
    }

    #[test]
    fn one_in_progress_task_per_listing() {
        let queue = queue();
        let listing_id = Uuid::new_v4();
        queue.enqueue(task(9, listing_id));
        queue.enqueue(task(8, listing_id));
        queue.enqueue(task(1, Uuid::new_v4()));

        let first = queue.claim(Utc::now(), &always_ready).unwrap();
        assert_eq!(first.task.listing_id, listing_id);

        // Same listing is excluded while in progress; the other listing's
        // task dispatches instead.
        let second = queue.claim(Utc::now(), &always_ready).unwrap();
        assert_ne!(second.task.listing_id, listing_id);
        assert!(queue.claim(Utc::now(), &always_ready).is_none());

        // Completion releases the exclusion.
        queue.complete_success(&first);
        let third = queue.claim(Utc::now(), &always_ready).unwrap();
        assert_eq!(third.task.listing_id, listing_id);
    }

    #[test]
    fn retailer_gate_skips_but_keeps_tasks() {
        let queue = queue();
        let mut blocked = task(9, Uuid::new_v4());
        blocked.retailer_id = "closed".into();
        queue.enqueue(blocked.clone());
        queue.enqueue(task(5, Uuid::new_v4()));

        let gate = |retailer: &str| retailer != "closed";
        let claimed = queue.claim(Utc::now(), &gate).unwrap();
        assert_eq!(claimed.task.priority, 5);

        // Once the retailer recovers the task is still there.
        let claimed = queue.claim(Utc::now(), &always_ready).unwrap();
        assert_eq!(claimed.task.id, blocked.id);
    }

    #[test]
    fn always_failing_task_stops_after_max_attempts() {
        let queue = queue();
        let t = task(5, Uuid::new_v4());
        let max_attempts = t.max_attempts;
        let id = queue.enqueue(t);

        let mut executions = 0;
        let mut now = Utc::now();
        loop {
            let Some(claimed) = queue.claim(now, &always_ready) else {
                // Not yet due: jump past the backoff.
                now = now + chrono::Duration::seconds(7_200);
                if queue.get(id).unwrap().status == TaskStatus::Failed {
                    break;
                }
                continue;
            };
            executions += 1;
            let disposition =
                queue.complete_failure(&claimed, FailureKind::NetworkError, "boom", now);
            if disposition == Disposition::Exhausted {
                break;
            }
        }

        assert_eq!(executions, max_attempts);
        assert_eq!(queue.get(id).unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn rate_limited_failures_do_not_consume_attempts() {
        let queue = queue();
        let id = queue.enqueue(task(5, Uuid::new_v4()));
        let now = Utc::now();

        let claimed = queue.claim(now, &always_ready).unwrap();
        let disposition = queue.complete_failure(&claimed, FailureKind::RateLimited, "429", now);
        assert!(matches!(disposition, Disposition::Retrying(_)));

        let task = queue.get(id).unwrap();
        assert_eq!(task.attempts, 0);
        assert_eq!(task.source, TaskSource::Retry);
        assert_eq!(task.reschedules, 1);
    }

    #[test]
    fn reaper_returns_expired_lease_to_pending() {
        let queue = TaskQueue::new(Duration::from_secs(60));
        let id = queue.enqueue(task(5, Uuid::new_v4()));

        let now = Utc::now();
        let claimed = queue.claim(now, &always_ready).unwrap();
        assert_eq!(claimed.task.id, id);

        // Before expiry nothing happens.
        assert!(queue.reap_expired(now + chrono::Duration::seconds(30)).is_empty());
        assert!(queue.claim(now, &always_ready).is_none());

        // After expiry the task is claimable again - exactly once.
        let later = now + chrono::Duration::seconds(61);
        assert_eq!(queue.reap_expired(later), vec![id]);
        let reclaimed = queue.claim(later, &always_ready).unwrap();
        assert_eq!(reclaimed.task.id, id);
        assert!(queue.claim(later, &always_ready).is_none());
    }

    #[test]
    fn stale_claim_cannot_release_a_reclaimed_task() {
        let queue = TaskQueue::new(Duration::from_secs(60));
        let listing_id = Uuid::new_v4();
        let id = queue.enqueue(task(5, listing_id));
        queue.enqueue(task(4, listing_id));

        let now = Utc::now();
        let stale = queue.claim(now, &always_ready).unwrap();
        assert_eq!(stale.task.id, id);

        // The lease expires and the same task is claimed again.
        let later = now + chrono::Duration::seconds(61);
        assert_eq!(queue.reap_expired(later), vec![id]);
        let fresh = queue.claim(later, &always_ready).unwrap();
        assert_eq!(fresh.task.id, id);

        // The resurrected worker reports in. Its claim is stale, so the
        // listing stays excluded and the task stays in progress.
        queue.complete_success(&stale);
        assert_eq!(queue.get(id).unwrap().status, TaskStatus::InProgress);
        assert!(queue.claim(later, &always_ready).is_none());

        let disposition =
            queue.complete_failure(&stale, FailureKind::NetworkError, "late", later);
        assert_eq!(disposition, Disposition::Stale);
        assert!(queue.claim(later, &always_ready).is_none());

        // The live claim still completes, which frees the listing for the
        // second task.
        queue.complete_success(&fresh);
        assert_eq!(queue.get(id).unwrap().status, TaskStatus::Succeeded);
        let next = queue.claim(later, &always_ready).unwrap();
        assert_eq!(next.task.listing_id, listing_id);
        assert_ne!(next.task.id, id);
    }

    #[test]
    fn deferral_is_not_an_attempt() {
        let queue = queue();
        let id = queue.enqueue(task(5, Uuid::new_v4()));
        let now = Utc::now();

        let claimed = queue.claim(now, &always_ready).unwrap();
        queue.defer(&claimed, Duration::from_secs(90), now);

        let task = queue.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        // Invisible until the deferral elapses.
        assert!(queue.claim(now, &always_ready).is_none());
        assert!(queue
            .claim(now + chrono::Duration::seconds(91), &always_ready)
            .is_some());
    }
}
