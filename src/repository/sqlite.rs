//! SQLite-backed store.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{select_rule, EngineStore, Result, StoreError};
use crate::models::{
    DiscoveryRequest, DiscoveryStatus, PriceObservation, ProductListing, RetailerError,
    StockStatus, TaskSource, ValidationRule, Verdict,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS listings (
    id TEXT PRIMARY KEY,
    variant TEXT NOT NULL,
    retailer_id TEXT NOT NULL,
    url TEXT NOT NULL,
    sku TEXT,
    category TEXT,
    unit_grams REAL,
    last_known_price REAL,
    last_scraped_at TEXT,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    UNIQUE (retailer_id, url)
);

CREATE TABLE IF NOT EXISTS observations (
    id TEXT PRIMARY KEY,
    listing_id TEXT NOT NULL REFERENCES listings(id),
    price REAL NOT NULL,
    previous_price REAL,
    change_amount REAL,
    change_percent REAL,
    confidence REAL NOT NULL,
    verdict TEXT NOT NULL,
    stock TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    source TEXT NOT NULL,
    UNIQUE (listing_id, recorded_at, price)
);

CREATE INDEX IF NOT EXISTS idx_observations_listing
    ON observations(listing_id, recorded_at DESC);

CREATE TABLE IF NOT EXISTS discovery_requests (
    id TEXT PRIMARY KEY,
    requester TEXT,
    query TEXT NOT NULL,
    retailers TEXT NOT NULL,
    status TEXT NOT NULL,
    requested_at TEXT NOT NULL,
    completed_at TEXT,
    listing_ids TEXT NOT NULL,
    errors TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS validation_rules (
    category TEXT UNIQUE,
    min_price_multiplier REAL NOT NULL,
    max_price_multiplier REAL NOT NULL,
    min_price_per_gram REAL,
    max_price_per_gram REAL,
    max_daily_change_pct REAL NOT NULL
);
"#;

/// Store over a single SQLite connection. Calls are short and fully
/// synchronous under the mutex; the guard never crosses an await.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EngineStore for SqliteStore {
    async fn save_listing(&self, listing: &ProductListing) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO listings (
                id, variant, retailer_id, url, sku, category, unit_grams,
                last_known_price, last_scraped_at, consecutive_failures,
                active, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                variant = excluded.variant,
                sku = excluded.sku,
                category = excluded.category,
                unit_grams = excluded.unit_grams,
                last_known_price = excluded.last_known_price,
                last_scraped_at = excluded.last_scraped_at,
                consecutive_failures = excluded.consecutive_failures,
                active = excluded.active
            "#,
            params![
                listing.id.to_string(),
                listing.variant,
                listing.retailer_id,
                listing.url,
                listing.sku,
                listing.category,
                listing.unit_grams,
                listing.last_known_price,
                listing.last_scraped_at,
                listing.consecutive_failures,
                listing.active,
                listing.created_at,
            ],
        )?;
        Ok(())
    }

    async fn get_listing(&self, id: Uuid) -> Result<Option<ProductListing>> {
        let conn = self.lock();
        let listing = conn
            .query_row(
                "SELECT * FROM listings WHERE id = ?1",
                params![id.to_string()],
                row_to_listing,
            )
            .optional()?;
        Ok(listing)
    }

    async fn find_listing(
        &self,
        retailer_id: &str,
        url: &str,
        sku: Option<&str>,
    ) -> Result<Option<ProductListing>> {
        let conn = self.lock();
        let by_url = conn
            .query_row(
                "SELECT * FROM listings WHERE retailer_id = ?1 AND url = ?2",
                params![retailer_id, url],
                row_to_listing,
            )
            .optional()?;
        if by_url.is_some() {
            return Ok(by_url);
        }
        match sku {
            Some(sku) => {
                let by_sku = conn
                    .query_row(
                        "SELECT * FROM listings WHERE retailer_id = ?1 AND sku = ?2",
                        params![retailer_id, sku],
                        row_to_listing,
                    )
                    .optional()?;
                Ok(by_sku)
            }
            None => Ok(None),
        }
    }

    async fn load_active_listings(
        &self,
        retailer_id: Option<&str>,
    ) -> Result<Vec<ProductListing>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM listings
            WHERE active = 1 AND (?1 IS NULL OR retailer_id = ?1)
            ORDER BY created_at ASC
            "#,
        )?;
        let listings = stmt
            .query_map(params![retailer_id], row_to_listing)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(listings)
    }

    async fn sibling_prices(&self, variant: &str, exclude: Uuid) -> Result<Vec<f64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT last_known_price FROM listings
            WHERE variant = ?1 AND id != ?2 AND active = 1
              AND last_known_price IS NOT NULL
            "#,
        )?;
        let prices = stmt
            .query_map(params![variant, exclude.to_string()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<f64>, _>>()?;
        Ok(prices)
    }

    async fn record_observation(&self, observation: &PriceObservation) -> Result<()> {
        let conn = self.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result: Result<()> = (|| {
            // Duplicate submissions (retry after a persistence timeout)
            // hit the uniqueness key and become no-ops.
            conn.execute(
                r#"
                INSERT OR IGNORE INTO observations (
                    id, listing_id, price, previous_price, change_amount,
                    change_percent, confidence, verdict, stock, recorded_at, source
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
                params![
                    observation.id.to_string(),
                    observation.listing_id.to_string(),
                    observation.price,
                    observation.previous_price,
                    observation.change_amount,
                    observation.change_percent,
                    observation.confidence,
                    observation.verdict.as_str(),
                    observation.stock.as_str(),
                    observation.recorded_at,
                    observation.source.as_str(),
                ],
            )?;

            // The scrape happened, whatever the verdict.
            conn.execute(
                r#"
                UPDATE listings SET
                    consecutive_failures = 0,
                    last_scraped_at = MAX(COALESCE(last_scraped_at, ?2), ?2)
                WHERE id = ?1
                "#,
                params![observation.listing_id.to_string(), observation.recorded_at],
            )?;

            // Only a valid observation may become the current price, and
            // only when it is not older than what the listing already has.
            if observation.verdict == Verdict::Valid {
                conn.execute(
                    r#"
                    UPDATE listings SET last_known_price = ?2
                    WHERE id = ?1
                      AND NOT EXISTS (
                          SELECT 1 FROM observations
                          WHERE listing_id = ?1 AND verdict = 'valid'
                            AND recorded_at > ?3
                      )
                    "#,
                    params![
                        observation.listing_id.to_string(),
                        observation.price,
                        observation.recorded_at,
                    ],
                )?;
            }
            Ok(())
        })();

        if result.is_ok() {
            conn.execute("COMMIT", [])?;
        } else {
            let _ = conn.execute("ROLLBACK", []);
        }
        result
    }

    async fn load_observations(
        &self,
        listing_id: Uuid,
        limit: u32,
    ) -> Result<Vec<PriceObservation>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM observations
            WHERE listing_id = ?1
            ORDER BY recorded_at DESC
            LIMIT ?2
            "#,
        )?;
        let observations = stmt
            .query_map(params![listing_id.to_string(), limit], row_to_observation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(observations)
    }

    async fn record_listing_failure(&self, listing_id: Uuid) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE listings SET consecutive_failures = consecutive_failures + 1 WHERE id = ?1",
            params![listing_id.to_string()],
        )?;
        Ok(())
    }

    async fn save_discovery_request(&self, request: &DiscoveryRequest) -> Result<()> {
        let retailers = serde_json::to_string(&request.retailers)?;
        let listing_ids = serde_json::to_string(&request.listing_ids)?;
        let errors = serde_json::to_string(&request.errors)?;
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO discovery_requests (
                id, requester, query, retailers, status, requested_at,
                completed_at, listing_ids, errors
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                completed_at = excluded.completed_at,
                listing_ids = excluded.listing_ids,
                errors = excluded.errors
            "#,
            params![
                request.id.to_string(),
                request.requester,
                request.query,
                retailers,
                request.status.as_str(),
                request.requested_at,
                request.completed_at,
                listing_ids,
                errors,
            ],
        )?;
        Ok(())
    }

    async fn get_discovery_request(&self, id: Uuid) -> Result<Option<DiscoveryRequest>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT * FROM discovery_requests WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>("id")?,
                        row.get::<_, Option<String>>("requester")?,
                        row.get::<_, String>("query")?,
                        row.get::<_, String>("retailers")?,
                        row.get::<_, String>("status")?,
                        row.get::<_, DateTime<Utc>>("requested_at")?,
                        row.get::<_, Option<DateTime<Utc>>>("completed_at")?,
                        row.get::<_, String>("listing_ids")?,
                        row.get::<_, String>("errors")?,
                    ))
                },
            )
            .optional()?;

        let Some((id, requester, query, retailers, status, requested_at, completed_at, listing_ids, errors)) =
            row
        else {
            return Ok(None);
        };

        Ok(Some(DiscoveryRequest {
            id: parse_uuid(&id)?,
            requester,
            query,
            retailers: serde_json::from_str(&retailers)?,
            status: parse_discovery_status(&status),
            requested_at,
            completed_at,
            listing_ids: serde_json::from_str::<Vec<Uuid>>(&listing_ids)?,
            errors: serde_json::from_str::<Vec<RetailerError>>(&errors)?,
        }))
    }

    async fn replace_validation_rules(&self, rules: &[ValidationRule]) -> Result<()> {
        let conn = self.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result: Result<()> = (|| {
            conn.execute("DELETE FROM validation_rules", [])?;
            for rule in rules {
                conn.execute(
                    r#"
                    INSERT INTO validation_rules (
                        category, min_price_multiplier, max_price_multiplier,
                        min_price_per_gram, max_price_per_gram, max_daily_change_pct
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#,
                    params![
                        rule.category,
                        rule.min_price_multiplier,
                        rule.max_price_multiplier,
                        rule.min_price_per_gram,
                        rule.max_price_per_gram,
                        rule.max_daily_change_pct,
                    ],
                )?;
            }
            Ok(())
        })();

        if result.is_ok() {
            conn.execute("COMMIT", [])?;
        } else {
            let _ = conn.execute("ROLLBACK", []);
        }
        result
    }

    async fn load_validation_rules(&self, category: Option<&str>) -> Result<ValidationRule> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM validation_rules")?;
        let rules = stmt
            .query_map([], |row| {
                Ok(ValidationRule {
                    category: row.get("category")?,
                    min_price_multiplier: row.get("min_price_multiplier")?,
                    max_price_multiplier: row.get("max_price_multiplier")?,
                    min_price_per_gram: row.get("min_price_per_gram")?,
                    max_price_per_gram: row.get("max_price_per_gram")?,
                    max_daily_change_pct: row.get("max_daily_change_pct")?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(select_rule(&rules, category))
    }
}

fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| {
        StoreError::Database(rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(e),
        ))
    })
}

fn uuid_column(row: &Row<'_>, column: &str) -> rusqlite::Result<Uuid> {
    let text: String = row.get(column)?;
    Uuid::parse_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_listing(row: &Row<'_>) -> rusqlite::Result<ProductListing> {
    Ok(ProductListing {
        id: uuid_column(row, "id")?,
        variant: row.get("variant")?,
        retailer_id: row.get("retailer_id")?,
        url: row.get("url")?,
        sku: row.get("sku")?,
        category: row.get("category")?,
        unit_grams: row.get("unit_grams")?,
        last_known_price: row.get("last_known_price")?,
        last_scraped_at: row.get("last_scraped_at")?,
        consecutive_failures: row.get("consecutive_failures")?,
        active: row.get("active")?,
        created_at: row.get("created_at")?,
    })
}

fn row_to_observation(row: &Row<'_>) -> rusqlite::Result<PriceObservation> {
    let verdict: String = row.get("verdict")?;
    let stock: String = row.get("stock")?;
    let source: String = row.get("source")?;
    Ok(PriceObservation {
        id: uuid_column(row, "id")?,
        listing_id: uuid_column(row, "listing_id")?,
        price: row.get("price")?,
        previous_price: row.get("previous_price")?,
        change_amount: row.get("change_amount")?,
        change_percent: row.get("change_percent")?,
        confidence: row.get("confidence")?,
        verdict: parse_verdict(&verdict),
        stock: parse_stock(&stock),
        recorded_at: row.get("recorded_at")?,
        source: parse_source(&source),
    })
}

fn parse_verdict(text: &str) -> Verdict {
    match text {
        "suspicious" => Verdict::Suspicious,
        "rejected" => Verdict::Rejected,
        _ => Verdict::Valid,
    }
}

fn parse_stock(text: &str) -> StockStatus {
    match text {
        "in_stock" => StockStatus::InStock,
        "out_of_stock" => StockStatus::OutOfStock,
        _ => StockStatus::Unknown,
    }
}

fn parse_source(text: &str) -> TaskSource {
    match text {
        "user_request" => TaskSource::UserRequest,
        "discovery" => TaskSource::Discovery,
        "retry" => TaskSource::Retry,
        _ => TaskSource::Scheduled,
    }
}

fn parse_discovery_status(text: &str) -> DiscoveryStatus {
    match text {
        "processing" => DiscoveryStatus::Processing,
        "completed" => DiscoveryStatus::Completed,
        "failed" => DiscoveryStatus::Failed,
        _ => DiscoveryStatus::Pending,
    }
}
