//! Scrape task state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a task came from; determines its default priority band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Scheduled,
    UserRequest,
    Discovery,
    Retry,
}

impl TaskSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskSource::Scheduled => "scheduled",
            TaskSource::UserRequest => "user_request",
            TaskSource::Discovery => "discovery",
            TaskSource::Retry => "retry",
        }
    }
}

/// Task lifecycle. `failed` re-enters `pending` while attempts remain;
/// `succeeded`, `failed` (exhausted) and `skipped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

/// A unit of scraping work for one listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeTask {
    pub id: Uuid,
    pub listing_id: Uuid,
    /// Denormalized from the listing so dispatch never needs a lookup.
    pub retailer_id: String,
    /// 1-10, higher dispatches first.
    pub priority: u8,
    pub source: TaskSource,
    /// Invisible to dispatch until this time has passed.
    pub scheduled_for: DateTime<Utc>,
    pub status: TaskStatus,
    /// Attempts that count against `max_attempts`. Rate-limited attempts
    /// are excluded; `reschedules` bounds those instead.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Total times this task has been put back on the queue, regardless of
    /// failure kind. Hard ceiling against permanently throttled retailers.
    pub reschedules: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScrapeTask {
    pub fn new(
        listing_id: Uuid,
        retailer_id: &str,
        priority: u8,
        source: TaskSource,
        scheduled_for: DateTime<Utc>,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            listing_id,
            retailer_id: retailer_id.to_string(),
            priority: priority.clamp(1, 10),
            source,
            scheduled_for,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts,
            reschedules: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for <= now
    }
}
