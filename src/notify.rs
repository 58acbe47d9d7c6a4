//! Price-drop notification surface.
//!
//! The engine emits an event whenever a valid observation lowers a
//! listing's price. Delivery is pluggable behind `AlertSink`; the default
//! sink just logs, the channel sink feeds an in-process consumer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// A confirmed price drop on one listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceDropEvent {
    pub listing_id: Uuid,
    pub variant: String,
    pub retailer_id: String,
    pub url: String,
    pub old_price: f64,
    pub new_price: f64,
    pub change_percent: f64,
    /// Validator confidence of the triggering observation.
    pub confidence: f64,
    pub observed_at: DateTime<Utc>,
}

/// Receives price-drop events. Implementations must not block the worker.
pub trait AlertSink: Send + Sync {
    fn notify(&self, event: PriceDropEvent);
}

/// Sink that records drops in the structured log.
#[derive(Debug, Default)]
pub struct LogSink;

impl AlertSink for LogSink {
    fn notify(&self, event: PriceDropEvent) {
        info!(
            listing = %event.listing_id,
            variant = %event.variant,
            retailer = %event.retailer_id,
            old = event.old_price,
            new = event.new_price,
            change_pct = format!("{:.1}", event.change_percent),
            confidence = format!("{:.2}", event.confidence),
            "price drop"
        );
    }
}

/// Sink that forwards events over an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PriceDropEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PriceDropEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelSink {
    fn notify(&self, event: PriceDropEvent) {
        if self.tx.send(event).is_err() {
            warn!("price drop receiver dropped, event discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(old: f64, new: f64) -> PriceDropEvent {
        PriceDropEvent {
            listing_id: Uuid::new_v4(),
            variant: "whey-1kg".into(),
            retailer_id: "shop".into(),
            url: "https://shop.example/p/1".into(),
            old_price: old,
            new_price: new,
            change_percent: (new - old) / old * 100.0,
            confidence: 0.9,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new();
        sink.notify(event(3_500.0, 2_999.0));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.new_price, 2_999.0);
        assert!(received.change_percent < 0.0);
    }

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.notify(event(100.0, 90.0));
    }
}
