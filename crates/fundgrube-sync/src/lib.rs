//! Crawl-and-reconcile pipeline and deal alerting.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fundgrube_adapters::CatalogClient;
use fundgrube_core::Shop;
use fundgrube_storage::{connect_store, PostingStore};
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub mod alert;
pub mod config;
pub mod crawl;
pub mod reconcile;
pub mod search;

#[cfg(test)]
mod testing;

pub use alert::{
    dispatcher_for, failure_alert, AlertDispatcher, AlertError, LogDispatcher, SmtpDispatcher,
};
pub use config::{SearchConfig, SmtpConfig, SyncConfig};
pub use crawl::Crawler;
pub use reconcile::{CrawlStats, Reconciler, SaveOutcome};
pub use search::{DealMatcher, QueryOutcome};

pub const CRATE_NAME: &str = "fundgrube-sync";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Use the only-new fast path instead of full crawls.
    pub only_new: bool,
    pub skip_crawl: bool,
    /// Serve every listing request from the fixture file.
    pub mocked: bool,
    pub find_all: bool,
    pub limit_outlets: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub store_backend: String,
    pub shops_crawled: usize,
    pub crawl: CrawlStats,
    pub queries_run: usize,
    pub deals_found: usize,
    pub alerts_sent: usize,
}

pub struct SyncPipeline {
    store: Arc<dyn PostingStore>,
    crawler: Crawler,
    matcher: DealMatcher,
    search: SearchConfig,
    options: RunOptions,
    shops: Vec<Shop>,
}

impl SyncPipeline {
    pub fn new(
        store: Arc<dyn PostingStore>,
        client: CatalogClient,
        dispatcher: Arc<dyn AlertDispatcher>,
        search: SearchConfig,
        options: RunOptions,
    ) -> Self {
        let crawler = Crawler::new(client, Reconciler::new(store.clone()))
            .with_category_blacklist(search.category_blacklist.clone())
            .with_limit_outlets(options.limit_outlets);
        let matcher = DealMatcher::new(store.clone(), dispatcher).with_find_all(options.find_all);
        // the fixture is one MM listing; serving it for both shops flips ownership each run
        let shops = if options.mocked {
            vec![Shop::MediaMarkt]
        } else {
            Shop::ALL.to_vec()
        };
        Self {
            store,
            crawler,
            matcher,
            search,
            options,
            shops,
        }
    }

    /// Wire store, catalog client and search document from `config`.
    pub async fn from_config(
        config: &SyncConfig,
        options: RunOptions,
        dispatcher: Arc<dyn AlertDispatcher>,
    ) -> Result<Self> {
        let search = SearchConfig::load(&config.search_config_path).await?;
        let store = connect_store(&config.database_url)
            .await
            .context("connecting to posting store")?;
        let client = CatalogClient::for_mode(
            options.mocked,
            config.http_client_config(),
            &config.fixture_path,
        )?;
        info!(
            store = store.backend(),
            transport = client.transport_name(),
            queries = search.queries.len(),
            "pipeline ready"
        );
        Ok(Self::new(store, client, dispatcher, search, options))
    }

    pub fn with_shops(mut self, shops: Vec<Shop>) -> Self {
        self.shops = shops;
        self
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);
        self.run(run_id).instrument(span).await
    }

    async fn run(&self, run_id: Uuid) -> Result<RunSummary> {
        let started_at = fundgrube_core::now();
        let mut crawl = CrawlStats::default();
        let mut shops_crawled = 0;

        if self.options.skip_crawl {
            info!("crawling skipped");
        } else {
            for &shop in &self.shops {
                let now = fundgrube_core::now();
                let span = info_span!("shop", %shop);
                let stats = if self.options.only_new {
                    self.crawler.crawl_new_postings(shop, now).instrument(span).await
                } else {
                    self.crawler.crawl_shop(shop, now).instrument(span).await
                }
                .with_context(|| format!("crawling {shop}"))?;

                info!(
                    %shop,
                    postings = stats.postings,
                    inserted = stats.inserted,
                    updated = stats.updated,
                    deactivated = stats.deactivated,
                    api_ms = stats.api_time.as_millis() as u64,
                    store_ms = stats.store_time.as_millis() as u64,
                    "shop crawled"
                );
                crawl += stats;
                shops_crawled += 1;
            }
        }

        let mut deals_found = 0;
        let mut alerts_sent = 0;
        for query in &self.search.queries {
            let outcome = self.matcher.run_query(query).await?;
            deals_found += outcome.deals.len();
            if outcome.alerted {
                alerts_sent += 1;
            }
        }

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: fundgrube_core::now(),
            store_backend: self.store.backend().to_string(),
            shops_crawled,
            crawl,
            queries_run: self.search.queries.len(),
            deals_found,
            alerts_sent,
        })
    }
}

/// Build the pipeline from process environment and run it once.
pub async fn run_once_from_env(
    options: RunOptions,
    dispatcher: Arc<dyn AlertDispatcher>,
) -> Result<RunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(&config, options, dispatcher).await?;
    pipeline.run_once().await
}
