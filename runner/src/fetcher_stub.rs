//! Placeholder Item Fetcher (C5). The real implementation is injected per deployment (HTML/HTTP
//! fetch-and-parse of marketplace pages is explicitly out of scope for this core); this stub
//! exists only so `marketwatch-runner worker` has something to construct.
//!
//! A production deployment wires its own `ItemFetcher` in place of this one before running the
//! worker subcommand.

use async_trait::async_trait;
use marketwatch_core::{Proxy, SearchFilters};
use marketwatch_worker::fetcher::{FetchOutcome, ItemFetcher};

pub struct UnconfiguredFetcher;

#[async_trait]
impl ItemFetcher for UnconfiguredFetcher {
    async fn fetch(&self, _filters: &SearchFilters, _proxy: &Proxy) -> FetchOutcome {
        FetchOutcome::Transient(anyhow::anyhow!(
            "no ItemFetcher configured: marketwatch-runner ships a stub, deployments must inject a real one"
        ))
    }
}
