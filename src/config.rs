//! TOML configuration.
//!
//! One file declares engine tuning, retailers (with their selectors and
//! proxies) and per-category validation rules. Retailer and rule sections
//! are hot-reloadable; `[engine]` changes need a restart.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::{Retailer, ValidationRule};
use crate::scrapers::SelectorSet;

/// Engine tuning knobs. Read once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Number of concurrent scrape workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// SQLite database path.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// How long a worker waits on the rate governor before deferring the
    /// task, in seconds.
    #[serde(default = "default_max_admission_wait")]
    pub max_admission_wait_secs: u64,
    /// Per-fetch deadline, in seconds.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    /// In-progress lease before the reaper reclaims a task, in seconds.
    #[serde(default = "default_lease")]
    pub lease_secs: u64,
    /// Counted attempts before a task fails permanently.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// How long a demoted identity slot stays out of rotation, in seconds.
    #[serde(default = "default_demotion_cooldown")]
    pub demotion_cooldown_secs: u64,
    /// How long an open circuit breaker suspends a retailer, in seconds.
    #[serde(default = "default_breaker_cooldown")]
    pub breaker_cooldown_secs: u64,
    /// Interval between config re-reads for retailers and rules, in
    /// seconds. Zero disables hot reload.
    #[serde(default = "default_config_refresh")]
    pub config_refresh_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            database_path: default_database_path(),
            max_admission_wait_secs: default_max_admission_wait(),
            task_timeout_secs: default_task_timeout(),
            lease_secs: default_lease(),
            max_attempts: default_max_attempts(),
            demotion_cooldown_secs: default_demotion_cooldown(),
            breaker_cooldown_secs: default_breaker_cooldown(),
            config_refresh_secs: default_config_refresh(),
        }
    }
}

impl EngineSettings {
    pub fn max_admission_wait(&self) -> Duration {
        Duration::from_secs(self.max_admission_wait_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn demotion_cooldown(&self) -> Duration {
        Duration::from_secs(self.demotion_cooldown_secs)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

/// One `[[retailers]]` block: the retailer entity plus the pieces only
/// configuration knows about (proxies, selectors).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetailerConfig {
    #[serde(flatten)]
    pub retailer: Retailer,
    /// Proxy URLs for identity rotation; empty means direct connection.
    #[serde(default)]
    pub proxies: Vec<String>,
    pub selectors: SelectorSet,
}

/// Root of the configuration file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub retailers: Vec<RetailerConfig>,
    /// Validation rules; at most one entry without a category (the global
    /// fallback).
    #[serde(default)]
    pub rules: Vec<ValidationRule>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        info!(
            path = %path.display(),
            retailers = config.retailers.len(),
            rules = config.rules.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for rc in &self.retailers {
            let r = &rc.retailer;
            anyhow::ensure!(!r.id.is_empty(), "retailer with empty id");
            anyhow::ensure!(
                r.requests_per_minute > 0 && r.requests_per_hour > 0,
                "retailer {}: rate limits must be positive",
                r.id
            );
            anyhow::ensure!(
                (0.0..=1.0).contains(&r.failure_rate_tolerance),
                "retailer {}: failure_rate_tolerance outside [0,1]",
                r.id
            );
        }
        let globals = self.rules.iter().filter(|r| r.category.is_none()).count();
        anyhow::ensure!(
            globals <= 1,
            "multiple global validation rules; keep at most one without a category"
        );
        for rule in &self.rules {
            anyhow::ensure!(
                rule.min_price_multiplier > 0.0
                    && rule.max_price_multiplier > rule.min_price_multiplier,
                "rule {:?}: multiplier bounds are not an interval",
                rule.category
            );
        }
        Ok(())
    }

    pub fn retailers(&self) -> Vec<Retailer> {
        self.retailers.iter().map(|rc| rc.retailer.clone()).collect()
    }

    pub fn find_retailer(&self, id: &str) -> Option<&RetailerConfig> {
        self.retailers.iter().find(|rc| rc.retailer.id == id)
    }
}

/// Re-read the file, returning `None` when it is unchanged or broken. A
/// broken edit must never take down a running engine.
pub fn reload_if_changed(path: &Path, current: &Config) -> Option<Config> {
    match Config::load(path) {
        Ok(fresh) if fresh != *current => Some(fresh),
        Ok(_) => None,
        Err(err) => {
            warn!(error = %err, "config reload failed, keeping previous configuration");
            None
        }
    }
}

/// Starter config written by `pricewatch init`.
pub const EXAMPLE_CONFIG: &str = r#"[engine]
workers = 4
database_path = "pricewatch.db"
max_admission_wait_secs = 30
task_timeout_secs = 45
max_attempts = 3

[[retailers]]
id = "example-shop"
name = "Example Shop"
requests_per_minute = 10
requests_per_hour = 300
min_request_spacing_ms = 2000
rotate_identity = true
failure_rate_tolerance = 0.15
scrape_interval_secs = 21600
sale_interval_secs = 3600
proxies = []

[retailers.selectors]
base_url = "https://shop.example"
search_url = "https://shop.example/search?q={query}"
price_selector = ".product-price"
title_selector = "h1.product-title"
stock_selector = ".availability"
result_selector = ".search-result"
result_link_selector = "a.result-link"
result_price_selector = ".result-price"

[[rules]]
min_price_multiplier = 0.1
max_price_multiplier = 10.0
max_daily_change_pct = 50.0

[[rules]]
category = "protein-powder"
min_price_per_gram = 0.5
max_price_per_gram = 20.0
"#;

fn default_workers() -> usize {
    4
}

fn default_database_path() -> PathBuf {
    PathBuf::from("pricewatch.db")
}

fn default_max_admission_wait() -> u64 {
    30
}

fn default_task_timeout() -> u64 {
    45
}

fn default_lease() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_demotion_cooldown() -> u64 {
    600
}

fn default_breaker_cooldown() -> u64 {
    300
}

fn default_config_refresh() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_parses() {
        let config: Config = toml::from_str(EXAMPLE_CONFIG).unwrap();
        config.validate().unwrap();

        assert_eq!(config.engine.workers, 4);
        let shop = config.find_retailer("example-shop").unwrap();
        assert_eq!(shop.retailer.requests_per_minute, 10);
        assert!(shop.retailer.rotate_identity);
        assert_eq!(shop.selectors.price_selector, ".product-price");

        // Global rule plus one category rule.
        assert_eq!(config.rules.len(), 2);
        assert!(config.rules[0].category.is_none());
        assert_eq!(config.rules[1].category.as_deref(), Some("protein-powder"));
        assert_eq!(config.rules[1].min_price_per_gram, Some(0.5));
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.engine.workers, 4);
        assert_eq!(config.engine.max_attempts, 3);
        assert!(config.retailers.is_empty());
    }

    #[test]
    fn rejects_two_global_rules() {
        let raw = "[[rules]]\n[[rules]]\n";
        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_multiplier_bounds() {
        let raw = "[[rules]]\nmin_price_multiplier = 5.0\nmax_price_multiplier = 2.0\n";
        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }
}
