//! Per-shop crawling: discovery, outlet batching and reconciliation of each crawl unit.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fundgrube_adapters::{
    group_outlets, normalize_posting, normalize_postings, CatalogClient, ListingScope, PageCursor,
};
use fundgrube_core::{
    Category, CategoryRef, DeactivationScope, Outlet, OutletSelector, Page, PostingFilter, Shop,
};
use fundgrube_storage::PostingStore;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::reconcile::{CrawlStats, Reconciler};

/// Outlets crawled per category when outlet limiting is on.
pub const LIMITED_OUTLETS: usize = 5;

pub struct Crawler {
    client: CatalogClient,
    reconciler: Reconciler,
    category_blacklist: Vec<String>,
    limit_outlets: bool,
}

impl Crawler {
    pub fn new(client: CatalogClient, reconciler: Reconciler) -> Self {
        Self {
            client,
            reconciler,
            category_blacklist: Vec::new(),
            limit_outlets: false,
        }
    }

    pub fn with_category_blacklist(mut self, blacklist: Vec<String>) -> Self {
        self.category_blacklist = blacklist;
        self
    }

    pub fn with_limit_outlets(mut self, limit_outlets: bool) -> Self {
        self.limit_outlets = limit_outlets;
        self
    }

    fn is_blacklisted(&self, category_id: &str) -> bool {
        self.category_blacklist.iter().any(|c| c == category_id)
    }

    /// Crawl every non-blacklisted category of `shop`, one outlet group at a time.
    pub async fn crawl_shop(&self, shop: Shop, now: DateTime<Utc>) -> Result<CrawlStats> {
        let mut stats = CrawlStats::default();

        let started = Instant::now();
        let discovery = self
            .client
            .fetch_page(shop, &ListingScope::default(), None)
            .await
            .with_context(|| format!("discovering categories of {shop}"))?;
        stats.api_time += started.elapsed();

        let categories: Vec<Category> = discovery
            .categories
            .into_iter()
            .filter(|c| {
                let skip = self.is_blacklisted(&c.id);
                if skip {
                    debug!(category = %c.id, "skipping blacklisted category");
                }
                !skip
            })
            .collect();
        info!(%shop, categories = categories.len(), "crawling shop");

        for category in &categories {
            let span = info_span!("category", %shop, category = %category.id);
            stats += self.crawl_category(shop, category, now).instrument(span).await?;
        }
        Ok(stats)
    }

    async fn crawl_category(
        &self,
        shop: Shop,
        category: &Category,
        now: DateTime<Utc>,
    ) -> Result<CrawlStats> {
        let mut stats = CrawlStats::default();

        let started = Instant::now();
        let discovery = self
            .client
            .fetch_page(shop, &ListingScope::category(&category.id), None)
            .await
            .with_context(|| format!("discovering outlets of {shop} category {}", category.id))?;
        stats.api_time += started.elapsed();

        let mut outlets = discovery.outlets;
        if self.limit_outlets {
            outlets.truncate(LIMITED_OUTLETS);
        }
        let mut groups = group_outlets(&outlets);
        if groups.is_empty() {
            groups.push(Vec::new());
        }
        debug!(outlets = outlets.len(), groups = groups.len(), "batched outlets");

        for group in &groups {
            stats += self
                .crawl_unit(shop, category, group, now)
                .await
                .with_context(|| {
                    format!(
                        "crawling {shop} category {} outlets {:?}",
                        category.id,
                        group.iter().map(|o| o.id).collect::<Vec<_>>()
                    )
                })?;
        }

        if !self.limit_outlets && !outlets.is_empty() {
            stats.deactivated += self.sweep_orphaned_outlets(shop, category, &outlets).await?;
        }

        info!(
            postings = stats.postings,
            inserted = stats.inserted,
            updated = stats.updated,
            deactivated = stats.deactivated,
            "category crawled"
        );
        Ok(stats)
    }

    /// Fetch one (shop, category, outlet group), save what changed and deactivate
    /// what vanished from exactly that scope.
    async fn crawl_unit(
        &self,
        shop: Shop,
        category: &Category,
        group: &[Outlet],
        now: DateTime<Utc>,
    ) -> Result<CrawlStats> {
        let scope = ListingScope::category(&category.id).with_outlets(group);
        let listing = self.client.fetch_all(shop, &scope).await?;
        if listing.truncated {
            warn!(
                outlets = ?scope.outlets,
                "listing exceeds the offset ceiling; postings beyond it are unreachable"
            );
        }

        let postings = normalize_postings(shop, &category.to_ref(), listing.postings);
        let seen: HashSet<String> = postings.iter().map(|p| p.id.clone()).collect();
        let mut stats = CrawlStats {
            postings: postings.len() as u64,
            api_time: listing.elapsed,
            ..CrawlStats::default()
        };

        let started = Instant::now();
        stats += self.reconciler.save_new_or_updated(postings, now).await?;
        let deactivation = DeactivationScope::for_group(shop, category.id.clone(), group);
        stats.deactivated += self
            .reconciler
            .deactivate_missing(&deactivation, &seen)
            .await?;
        stats.store_time += started.elapsed();
        Ok(stats)
    }

    /// Outlets dropping out of discovery have no postings left upstream, so
    /// their stored postings in this category are deactivated.
    async fn sweep_orphaned_outlets(
        &self,
        shop: Shop,
        category: &Category,
        outlets: &[Outlet],
    ) -> Result<u64> {
        let scope = DeactivationScope {
            shop,
            category_id: category.id.clone(),
            outlets: OutletSelector::NotIn(outlets.iter().map(|o| o.id).collect()),
        };
        let swept = self
            .reconciler
            .deactivate_missing(&scope, &HashSet::new())
            .await
            .with_context(|| {
                format!("sweeping orphaned outlets of {shop} category {}", category.id)
            })?;
        if swept > 0 {
            info!(swept, "deactivated postings of outlets no longer listed");
        }
        Ok(swept)
    }

    /// Page through the whole shop listing, cheapest first, saving each page until
    /// one yields no new posting. Never deactivates anything.
    ///
    /// Falls back to [`Crawler::crawl_shop`] while the store holds nothing for `shop`,
    /// since termination relies on earlier full coverage.
    pub async fn crawl_new_postings(&self, shop: Shop, now: DateTime<Utc>) -> Result<CrawlStats> {
        let known = self
            .reconciler
            .store()
            .find_postings(&PostingFilter::for_shop(shop), Page::first(1))
            .await?;
        if known.is_empty() {
            warn!(%shop, "no stored postings yet; running a full crawl instead of only-new");
            return self.crawl_shop(shop, now).await;
        }

        let mut stats = CrawlStats::default();
        let scope = ListingScope::default();

        let started = Instant::now();
        let discovery = self
            .client
            .fetch_page(shop, &scope, None)
            .await
            .with_context(|| format!("discovering categories of {shop}"))?;
        stats.api_time += started.elapsed();
        let categories: HashMap<String, CategoryRef> = discovery
            .categories
            .iter()
            .map(|c| (c.id.clone(), c.to_ref()))
            .collect();

        let mut cursor = PageCursor::new();
        loop {
            let started = Instant::now();
            let page = self
                .client
                .next_page(shop, &scope, &mut cursor)
                .await
                .with_context(|| format!("fetching new postings of {shop}"))?;
            stats.api_time += started.elapsed();
            let Some(page) = page else {
                break;
            };

            let postings: Vec<_> = page
                .postings
                .into_iter()
                .filter(|raw| !self.is_blacklisted(&raw.top_level_catalog_id))
                .map(|raw| {
                    let category = categories
                        .get(&raw.top_level_catalog_id)
                        .cloned()
                        .unwrap_or_else(|| CategoryRef {
                            id: raw.top_level_catalog_id.clone(),
                            name: String::new(),
                        });
                    normalize_posting(shop, &category, raw)
                })
                .collect();
            stats.postings += postings.len() as u64;

            let started = Instant::now();
            let saved = self.reconciler.save_new_or_updated(postings, now).await?;
            stats.store_time += started.elapsed();
            stats += saved;

            if saved.inserted == 0 {
                debug!(%shop, "page brought nothing new; stopping");
                break;
            }
        }

        info!(
            %shop,
            postings = stats.postings,
            inserted = stats.inserted,
            updated = stats.updated,
            "new postings crawled"
        );
        Ok(stats)
    }
}
