//! The Item Fetcher (C5) is an injected external capability, deliberately out of scope for this
//! core: the HTTP/HTML fetch-and-parse of marketplace pages lives behind this trait so the
//! worker never depends on a concrete upstream client.

use async_trait::async_trait;
use marketwatch_core::{Proxy, SearchFilters};
use serde::{Deserialize, Serialize};

/// One matched listing as returned by a fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedListing {
    /// The upstream listing identifier, when the parsed payload carries one.
    pub listing_id: Option<String>,
    pub item_name: String,
    /// Structured price, preferred over any display-string parse.
    pub price: f64,
    /// Opaque parsed listing payload.
    pub item_data: serde_json::Value,
    pub market_url: Option<String>,
}

/// Classified result of one fetch attempt, already bucketed the way the Proxy Pool Manager's
/// `report` expects (`ok` / `transient_fail` / `rate_limited` / `hard_fail`).
pub enum FetchOutcome {
    Matches(Vec<FetchedListing>),
    RateLimited,
    Transient(anyhow::Error),
    Hard(anyhow::Error),
    ParseError(anyhow::Error),
}

#[async_trait]
pub trait ItemFetcher: Send + Sync {
    async fn fetch(&self, filters: &SearchFilters, proxy: &Proxy) -> FetchOutcome;
}
