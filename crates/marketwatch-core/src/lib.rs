//! Shared core abstractions for the marketplace listing monitor.
//!
//! This crate defines the cross-crate contracts used by the scheduler, worker, proxy pool, and
//! admin crates: the durable task queue, the coordination KV store, the persisted domain model,
//! and a typed error kind used to drive the branching behavior spec'd for the worker and
//! scheduler (store-unavailable backoff, upstream classification, lock contention, ...).
//!
//! `marketwatch-core` is an internal crate (`publish = false`).

pub mod error;
pub mod kv;
pub mod models;
pub mod queue;

pub use error::{Error, ErrorKind, Result, ResultExt};
pub use kv::{KvStore, RedisKv};
pub use models::{
    canonicalize_proxy_url, DlqEntry, FloatRange, FoundItem, MonitoringTask, PatternList,
    PatternItemType, Proxy, ProxyOutcome, SearchFilters, StickerPosition, StickersFilter,
};
pub use queue::{list_dlq_entries, PgQueue, Queue, QueueMessage};
