//! Persisted and wire-format domain types: `monitoring_tasks`, `found_items`, `proxies`, the
//! `filters` JSON shape, and the proxy-report outcome enum used by the proxy pool.

use crate::error::{Error, ErrorKind, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, Row};
use uuid::Uuid;

/// A row of `monitoring_tasks`.
///
/// `appid`/`currency` are first-class columns (not buried only in `filters`) so the scheduler
/// can build a queue payload without parsing JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringTask {
    pub id: i64,
    pub name: String,
    pub item_name: String,
    pub appid: i32,
    pub currency: i32,
    pub filters: SearchFilters,
    pub is_active: bool,
    pub check_interval: i32,
    pub total_checks: i64,
    pub items_found: i64,
    pub last_check: Option<DateTime<Utc>>,
    pub next_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MonitoringTask {
    /// Assembles a row the way the teacher's queue code assembles `QueueMessage` from a
    /// `sqlx::Row`: explicit `try_get` per column, no `FromRow` derive.
    pub fn from_row(row: &PgRow) -> Result<Self> {
        let filters_json: serde_json::Value = row.try_get("filters")?;
        let filters = serde_json::from_value(filters_json)
            .map_err(|e| Error::new(ErrorKind::ParsePayload, e))?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            item_name: row.try_get("item_name")?,
            appid: row.try_get("appid")?,
            currency: row.try_get("currency")?,
            filters,
            is_active: row.try_get("is_active")?,
            check_interval: row.try_get("check_interval")?,
            total_checks: row.try_get("total_checks")?,
            items_found: row.try_get("items_found")?,
            last_check: row.try_get("last_check")?,
            next_check: row.try_get("next_check")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Opaque search-filter payload, stored as JSON under `monitoring_tasks.filters`.
///
/// The upstream alternates between encoding this as a JSON string and a JSON object; both are
/// legal input to the deserializer, and the structured form is always what gets stored back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchFilters {
    pub item_name: String,
    pub appid: i32,
    pub currency: i32,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub float_range: Option<FloatRange>,
    #[serde(default)]
    pub pattern_list: Option<PatternList>,
    #[serde(default)]
    pub stickers_filter: Option<StickersFilter>,
    #[serde(default)]
    pub auto_update_base_price: bool,
    #[serde(default)]
    pub base_price_update_interval: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FloatRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternList {
    pub patterns: Vec<i32>,
    pub item_type: PatternItemType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatternItemType {
    Skin,
    Keychain,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StickersFilter {
    #[serde(default)]
    pub max_overpay_coefficient: Option<f64>,
    #[serde(default)]
    pub min_stickers_price: Option<f64>,
    #[serde(default)]
    pub stickers: Option<Vec<StickerPosition>>,
    #[serde(default)]
    pub total_stickers_price_min: Option<f64>,
    #[serde(default)]
    pub total_stickers_price_max: Option<f64>,
}

/// A single sticker constraint within a `stickers_filter`. The upstream payload carries
/// additional, per-sticker fields beyond `position` (name, wear) which are preserved verbatim
/// via `extra` rather than enumerated, since this core never interprets them itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StickerPosition {
    pub position: i32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A row of `found_items`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundItem {
    pub id: i64,
    pub task_id: i64,
    pub item_name: String,
    pub price: f64,
    /// Opaque parsed listing payload, stored and transmitted as a JSON string (not parsed JSON)
    /// to match the wire contract's `item_data_json` field.
    pub item_data: String,
    /// Listing identifier extracted from `item_data` at insert time, or `None` when the fetcher
    /// did not supply one (the dedupe key then falls back to `(task_id, item_name, price)`).
    /// Backs the partial unique indexes that enforce "no duplicate FoundItem".
    pub listing_id: Option<String>,
    pub market_url: Option<String>,
    pub notification_sent: bool,
    pub notification_sent_at: Option<DateTime<Utc>>,
    pub found_at: DateTime<Utc>,
}

impl FoundItem {
    pub fn from_row(row: &PgRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            item_name: row.try_get("item_name")?,
            price: row.try_get("price")?,
            item_data: row.try_get("item_data")?,
            listing_id: row.try_get("listing_id")?,
            market_url: row.try_get("market_url")?,
            notification_sent: row.try_get("notification_sent")?,
            notification_sent_at: row.try_get("notification_sent_at")?,
            found_at: row.try_get("found_at")?,
        })
    }
}

/// A row of `proxies`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub id: i64,
    pub url: String,
    pub is_active: bool,
    pub delay_seconds: i32,
    pub success_count: i64,
    pub fail_count: i64,
    /// Count of consecutive `rate_limited` reports since the last `ok`, used to exponentially
    /// grow the block TTL applied in C2 (10min base doubling to a 60min cap).
    pub block_level: i32,
    pub last_used: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Proxy {
    pub fn from_row(row: &PgRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            url: row.try_get("url")?,
            is_active: row.try_get("is_active")?,
            delay_seconds: row.try_get("delay_seconds")?,
            success_count: row.try_get("success_count")?,
            fail_count: row.try_get("fail_count")?,
            block_level: row.try_get("block_level")?,
            last_used: row.try_get("last_used")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// A row of `parsing_tasks_dlq`: a message that exhausted its retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: Uuid,
    pub original_queue: String,
    pub payload: serde_json::Value,
    pub error: String,
    pub retry_count: i32,
    pub failed_at: DateTime<Utc>,
}

impl DlqEntry {
    pub fn from_row(row: &PgRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            original_queue: row.try_get("original_queue")?,
            payload: row.try_get("payload")?,
            error: row.try_get("error")?,
            retry_count: row.try_get("retry_count")?,
            failed_at: row.try_get("failed_at")?,
        })
    }
}

/// Outcome reported back to the Proxy Pool Manager after a fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOutcome {
    Ok,
    TransientFail,
    RateLimited,
    HardFail,
}

/// Canonicalizes a proxy URL for uniqueness comparisons: scheme + userinfo + host:port, any
/// trailing extra segment dropped — whether it arrives as a path (`host:port/extra`) or as a
/// bare colon-separated tail (`host:port:extra`, which `url::Url::parse` would otherwise reject
/// outright as an invalid port).
pub fn canonicalize_proxy_url(raw: &str) -> anyhow::Result<String> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };

    let (scheme_prefix, rest) = with_scheme
        .split_once("://")
        .ok_or_else(|| anyhow::anyhow!("proxy URL missing scheme separator: {raw}"))?;

    // Isolate the authority (userinfo@host:port) from any path/query/fragment, then keep only
    // `host:port` within it — this drops a trailing path segment and a trailing `:extra` colon
    // segment the same way, before the string ever reaches `url::Url::parse`.
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..authority_end];
    let (userinfo, host_port) = match authority.rsplit_once('@') {
        Some((userinfo, host_port)) => (Some(userinfo), host_port),
        None => (None, authority),
    };
    let mut host_port_parts = host_port.splitn(3, ':');
    let host = host_port_parts.next().unwrap_or_default();
    let port = host_port_parts.next();
    let truncated_authority = match (userinfo, port) {
        (Some(u), Some(p)) => format!("{u}@{host}:{p}"),
        (Some(u), None) => format!("{u}@{host}"),
        (None, Some(p)) => format!("{host}:{p}"),
        (None, None) => host.to_string(),
    };

    let url = url::Url::parse(&format!("{scheme_prefix}://{truncated_authority}"))?;
    let scheme = url.scheme();
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("proxy URL missing host: {raw}"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow::anyhow!("proxy URL missing port: {raw}"))?;
    let userinfo = if url.username().is_empty() {
        String::new()
    } else {
        match url.password() {
            Some(password) => format!("{}:{}@", url.username(), password),
            None => format!("{}@", url.username()),
        }
    };
    Ok(format!("{scheme}://{userinfo}{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_drops_trailing_path_segment() {
        let a = canonicalize_proxy_url("http://u:p@h:1234/extra/path").unwrap();
        let b = canonicalize_proxy_url("u:p@h:1234").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn canonicalize_drops_trailing_colon_segment() {
        let a = canonicalize_proxy_url("http://u:p@h:1234:extra").unwrap();
        let b = canonicalize_proxy_url("u:p@h:1234").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn canonicalize_without_userinfo() {
        let c = canonicalize_proxy_url("http://h:8080").unwrap();
        assert_eq!(c, "http://h:8080");
    }

    #[test]
    fn filters_json_roundtrips_as_object() {
        let raw = r#"{
            "item_name": "AK-47 | Redline",
            "appid": 730,
            "currency": 1,
            "max_price": 50.0,
            "pattern_list": {"patterns": [522], "item_type": "skin"}
        }"#;
        let filters: SearchFilters = serde_json::from_str(raw).unwrap();
        assert_eq!(filters.appid, 730);
        assert_eq!(filters.max_price, Some(50.0));
        assert!(filters.float_range.is_none());
        assert_eq!(
            filters.pattern_list.unwrap().item_type,
            PatternItemType::Skin
        );
    }
}
