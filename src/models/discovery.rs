//! Discovery request lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a discovery request. Terminal once completed or failed;
/// the result snapshot is immutable afterward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DiscoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryStatus::Pending => "pending",
            DiscoveryStatus::Processing => "processing",
            DiscoveryStatus::Completed => "completed",
            DiscoveryStatus::Failed => "failed",
        }
    }
}

/// A failure scoped to one retailer within a discovery request. One
/// retailer erroring never fails the whole request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetailerError {
    pub retailer_id: String,
    pub message: String,
}

/// A user search in flight: which retailers to ask, what came back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub id: Uuid,
    /// Requesting user, if any; anonymous searches are allowed.
    pub requester: Option<String>,
    pub query: String,
    pub retailers: Vec<String>,
    pub status: DiscoveryStatus,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Listings registered or matched by this request.
    pub listing_ids: Vec<Uuid>,
    pub errors: Vec<RetailerError>,
}

impl DiscoveryRequest {
    pub fn new(query: &str, retailers: Vec<String>, requester: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            requester,
            query: query.to_string(),
            retailers,
            status: DiscoveryStatus::Pending,
            requested_at: Utc::now(),
            completed_at: None,
            listing_ids: Vec::new(),
            errors: Vec::new(),
        }
    }
}
