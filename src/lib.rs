//! Pricewatch - demand-driven retail price scraping and validation engine.
//!
//! Turns user searches into tracked product listings and keeps validated,
//! time-stamped price history for them while staying inside each retailer's
//! rate limits.

pub mod cli;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod identity;
pub mod models;
pub mod notify;
pub mod rate_limit;
pub mod repository;
pub mod scrapers;
pub mod validator;
