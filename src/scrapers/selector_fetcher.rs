//! Selector-driven fetch executor.
//!
//! Most retailers differ only in CSS selectors and URL shape, so one
//! configurable implementation covers them; a genuinely odd retailer can
//! still provide its own `PriceFetcher`.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    parse_price, Candidate, FailureKind, FetchClient, FetchError, FetchedPrice, PriceFetcher,
};
use crate::identity::Identity;
use crate::models::StockStatus;

/// CSS selectors and URL templates for one retailer, from config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorSet {
    /// Base URL used to resolve relative links, e.g. "https://shop.example".
    pub base_url: String,
    /// Search URL template with a `{query}` placeholder.
    pub search_url: String,
    /// Selector for the price element on a product page.
    pub price_selector: String,
    /// Selector for the product title.
    #[serde(default)]
    pub title_selector: Option<String>,
    /// Selector for the availability element.
    #[serde(default)]
    pub stock_selector: Option<String>,
    /// Availability text fragments meaning "out of stock".
    #[serde(default = "default_oos_markers")]
    pub out_of_stock_markers: Vec<String>,
    /// Selector for one search result container.
    pub result_selector: String,
    /// Selector for the product link inside a result.
    #[serde(default = "default_link_selector")]
    pub result_link_selector: String,
    /// Selector for the price inside a result, when shown.
    #[serde(default)]
    pub result_price_selector: Option<String>,
    /// Attribute on the result container carrying the retailer SKU.
    #[serde(default)]
    pub sku_attribute: Option<String>,
}

fn default_oos_markers() -> Vec<String> {
    vec![
        "out of stock".into(),
        "sold out".into(),
        "currently unavailable".into(),
        "notify me".into(),
    ]
}

fn default_link_selector() -> String {
    "a".into()
}

/// Parsed selectors ready for extraction.
struct CompiledSelectors {
    price: Selector,
    title: Option<Selector>,
    stock: Option<Selector>,
    result: Selector,
    result_link: Selector,
    result_price: Option<Selector>,
}

/// `PriceFetcher` implementation driven by a `SelectorSet`.
pub struct SelectorFetcher {
    retailer_id: String,
    config: SelectorSet,
    selectors: CompiledSelectors,
}

impl SelectorFetcher {
    pub fn new(retailer_id: &str, config: SelectorSet) -> anyhow::Result<Self> {
        let selectors = CompiledSelectors {
            price: compile(&config.price_selector)
                .with_context(|| format!("{retailer_id}: price_selector"))?,
            title: config
                .title_selector
                .as_deref()
                .map(compile)
                .transpose()
                .with_context(|| format!("{retailer_id}: title_selector"))?,
            stock: config
                .stock_selector
                .as_deref()
                .map(compile)
                .transpose()
                .with_context(|| format!("{retailer_id}: stock_selector"))?,
            result: compile(&config.result_selector)
                .with_context(|| format!("{retailer_id}: result_selector"))?,
            result_link: compile(&config.result_link_selector)
                .with_context(|| format!("{retailer_id}: result_link_selector"))?,
            result_price: config
                .result_price_selector
                .as_deref()
                .map(compile)
                .transpose()
                .with_context(|| format!("{retailer_id}: result_price_selector"))?,
        };
        Ok(Self {
            retailer_id: retailer_id.to_string(),
            config,
            selectors,
        })
    }

    /// Extract price, stock and title from a product page body.
    ///
    /// Synchronous on purpose: `Html` is not `Send`, so parsing must not
    /// straddle an await point.
    fn extract_product(&self, body: &str) -> Result<FetchedPrice, FetchError> {
        let document = Html::parse_document(body);

        let price_text = document
            .select(&self.selectors.price)
            .next()
            .map(|el| el.text().collect::<String>())
            .ok_or_else(|| {
                FetchError::new(
                    FailureKind::ExtractionFailure,
                    format!("{}: price selector matched nothing", self.retailer_id),
                )
                .with_snippet(body)
            })?;

        let price = parse_price(&price_text).ok_or_else(|| {
            FetchError::new(
                FailureKind::ExtractionFailure,
                format!(
                    "{}: unparsable price text {:?}",
                    self.retailer_id,
                    price_text.trim()
                ),
            )
            .with_snippet(body)
        })?;

        let stock = match &self.selectors.stock {
            Some(selector) => match document.select(selector).next() {
                Some(el) => {
                    let text = el.text().collect::<String>().to_lowercase();
                    if self
                        .config
                        .out_of_stock_markers
                        .iter()
                        .any(|marker| text.contains(&marker.to_lowercase()))
                    {
                        StockStatus::OutOfStock
                    } else {
                        StockStatus::InStock
                    }
                }
                None => StockStatus::Unknown,
            },
            None => StockStatus::Unknown,
        };

        let title = self.selectors.title.as_ref().and_then(|selector| {
            document
                .select(selector)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string())
        });

        Ok(FetchedPrice { price, stock, title })
    }

    /// Extract search result candidates from a results page body.
    fn extract_candidates(&self, body: &str) -> Vec<Candidate> {
        let document = Html::parse_document(body);
        let mut candidates = Vec::new();

        for result in document.select(&self.selectors.result) {
            let Some(link) = result.select(&self.selectors.result_link).next() else {
                continue;
            };
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            let Some(url) = self.canonical_url(href) else {
                continue;
            };

            let title = {
                let text = link.text().collect::<String>();
                let trimmed = text.trim().to_string();
                if trimmed.is_empty() {
                    result.text().collect::<String>().trim().to_string()
                } else {
                    trimmed
                }
            };
            if title.is_empty() {
                continue;
            }

            let sku = self
                .config
                .sku_attribute
                .as_deref()
                .and_then(|attr| result.value().attr(attr))
                .map(|s| s.to_string());

            let price = self.selectors.result_price.as_ref().and_then(|selector| {
                result
                    .select(selector)
                    .next()
                    .and_then(|el| parse_price(&el.text().collect::<String>()))
            });

            candidates.push(Candidate {
                title,
                url,
                sku,
                price,
            });
        }

        candidates
    }

    /// Resolve a possibly-relative href against the retailer base URL and
    /// strip query/fragment noise so the same product always keys the same.
    fn canonical_url(&self, href: &str) -> Option<String> {
        let base = url::Url::parse(&self.config.base_url).ok()?;
        let mut joined = base.join(href).ok()?;
        joined.set_query(None);
        joined.set_fragment(None);
        Some(joined.to_string())
    }

    fn search_url_for(&self, query: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
        self.config.search_url.replace("{query}", &encoded)
    }
}

#[async_trait]
impl PriceFetcher for SelectorFetcher {
    async fn fetch(
        &self,
        url: &str,
        identity: &Identity,
        timeout: Duration,
    ) -> Result<FetchedPrice, FetchError> {
        let client = FetchClient::for_identity(identity, timeout)?;
        let body = client.get_text(url).await?;
        self.extract_product(&body)
    }

    async fn search(
        &self,
        query: &str,
        identity: &Identity,
        timeout: Duration,
    ) -> Result<Vec<Candidate>, FetchError> {
        let search_url = self.search_url_for(query);
        let client = FetchClient::for_identity(identity, timeout)?;
        let body = client.get_text(&search_url).await?;
        let candidates = self.extract_candidates(&body);
        debug!(
            retailer = %self.retailer_id,
            query,
            count = candidates.len(),
            "search results extracted"
        );
        Ok(candidates)
    }
}

fn compile(selector: &str) -> anyhow::Result<Selector> {
    Selector::parse(selector).map_err(|e| anyhow::anyhow!("invalid selector {selector:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher() -> SelectorFetcher {
        SelectorFetcher::new(
            "shop",
            SelectorSet {
                base_url: "https://shop.example".into(),
                search_url: "https://shop.example/search?q={query}".into(),
                price_selector: ".price".into(),
                title_selector: Some("h1.product-title".into()),
                stock_selector: Some(".availability".into()),
                out_of_stock_markers: default_oos_markers(),
                result_selector: ".product-card".into(),
                result_link_selector: "a.product-link".into(),
                result_price_selector: Some(".card-price".into()),
                sku_attribute: Some("data-sku".into()),
            },
        )
        .unwrap()
    }

    #[test]
    fn extracts_price_stock_and_title() {
        let body = r#"
            <html><body>
              <h1 class="product-title"> Whey Isolate 1kg </h1>
              <span class="price">₹2,499.00</span>
              <div class="availability">In stock, ships tomorrow</div>
            </body></html>
        "#;
        let result = fetcher().extract_product(body).unwrap();
        assert_eq!(result.price, 2_499.0);
        assert_eq!(result.stock, StockStatus::InStock);
        assert_eq!(result.title.as_deref(), Some("Whey Isolate 1kg"));
    }

    #[test]
    fn out_of_stock_marker_wins() {
        let body = r#"
            <html><body>
              <span class="price">₹2,499</span>
              <div class="availability">Sold Out - Notify Me</div>
            </body></html>
        "#;
        let result = fetcher().extract_product(body).unwrap();
        assert_eq!(result.stock, StockStatus::OutOfStock);
    }

    #[test]
    fn missing_price_is_extraction_failure_with_snippet() {
        let body = "<html><body><div>layout changed completely</div></body></html>";
        let err = fetcher().extract_product(body).unwrap_err();
        assert_eq!(err.kind, FailureKind::ExtractionFailure);
        assert!(err.snippet.is_some());
    }

    #[test]
    fn extracts_search_candidates() {
        let body = r#"
            <html><body>
              <div class="product-card" data-sku="WI-1001">
                <a class="product-link" href="/p/whey-isolate-1kg?ref=search">Whey Isolate 1kg</a>
                <span class="card-price">₹2,499</span>
              </div>
              <div class="product-card" data-sku="WC-2002">
                <a class="product-link" href="https://shop.example/p/whey-conc-2kg">Whey Concentrate 2kg</a>
                <span class="card-price">₹3,299</span>
              </div>
              <div class="product-card"><span>no link here</span></div>
            </body></html>
        "#;
        let candidates = fetcher().extract_candidates(body);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].url, "https://shop.example/p/whey-isolate-1kg");
        assert_eq!(candidates[0].sku.as_deref(), Some("WI-1001"));
        assert_eq!(candidates[0].price, Some(2_499.0));
        assert_eq!(candidates[1].title, "Whey Concentrate 2kg");
    }

    #[test]
    fn search_url_encodes_query() {
        let url = fetcher().search_url_for("whey protein 1kg");
        assert_eq!(url, "https://shop.example/search?q=whey+protein+1kg");
    }
}
