//! Data models for the pricewatch engine.

mod discovery;
mod listing;
mod observation;
mod retailer;
mod rules;
mod task;

pub use discovery::{DiscoveryRequest, DiscoveryStatus, RetailerError};
pub use listing::ProductListing;
pub use observation::{PriceObservation, StockStatus, Verdict};
pub use retailer::{Retailer, SalePeriod};
pub use rules::ValidationRule;
pub use task::{ScrapeTask, TaskSource, TaskStatus};
