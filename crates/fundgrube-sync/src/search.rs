//! Saved-query evaluation with per-query watermarks.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fundgrube_core::{Page, Posting, PostingFilter, Query, SearchOperation};
use fundgrube_storage::PostingStore;
use tracing::{debug, info};

use crate::alert::AlertDispatcher;

pub const SEARCH_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub hash: String,
    pub deals: Vec<Posting>,
    pub alerted: bool,
}

pub struct DealMatcher {
    store: Arc<dyn PostingStore>,
    dispatcher: Arc<dyn AlertDispatcher>,
    find_all: bool,
}

impl DealMatcher {
    pub fn new(store: Arc<dyn PostingStore>, dispatcher: Arc<dyn AlertDispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            find_all: false,
        }
    }

    /// Ignore watermarks and match regardless of modification time.
    pub fn with_find_all(mut self, find_all: bool) -> Self {
        self.find_all = find_all;
        self
    }

    async fn since(&self, hash: &str) -> Result<Option<DateTime<Utc>>> {
        if self.find_all {
            return Ok(None);
        }
        let op = self.store.find_search_operation(hash).await?;
        Ok(Some(op.map_or(DateTime::UNIX_EPOCH, |op| op.searched_at)))
    }

    /// Collect postings changed since the query's watermark, alert when there are any,
    /// then advance the watermark. A failed alert aborts before the watermark moves.
    pub async fn run_query(&self, query: &Query) -> Result<QueryOutcome> {
        let hash = query.content_hash();
        let since = self.since(&hash).await?;
        let filter = PostingFilter::from_query(query, since);
        debug!(query = query.label(), ?since, "running query");

        let mut deals = Vec::new();
        let mut page = Page::first(SEARCH_PAGE_SIZE);
        loop {
            let batch = self
                .store
                .find_postings(&filter, page)
                .await
                .with_context(|| format!("searching `{}`", query.label()))?;
            let fetched = batch.len();
            deals.extend(batch);
            if fetched < page.limit {
                break;
            }
            page = page.next();
        }

        let alerted = !deals.is_empty();
        if alerted {
            info!(query = query.label(), deals = deals.len(), "found deals");
            self.dispatcher
                .dispatch(&format_subject(&deals), format_digest(query, &deals).as_bytes())
                .await
                .with_context(|| format!("sending deals of `{}`", query.label()))?;
        }

        self.store
            .save_search_operation(&SearchOperation::for_query(query, fundgrube_core::now()))
            .await?;
        Ok(QueryOutcome {
            hash,
            deals,
            alerted,
        })
    }
}

/// Headline naming the cheapest deal; `deals` is expected in price order.
pub fn format_subject(deals: &[Posting]) -> String {
    match deals.first() {
        None => "Found no deals. 😿".to_string(),
        Some(best) => format!(
            "Found {} for {:.2}€ in {} ({} deal(s) overall)",
            best.name,
            best.price,
            best.outlet.name,
            deals.len()
        ),
    }
}

pub fn format_digest(query: &Query, deals: &[Posting]) -> String {
    let mut digest = String::new();
    if !query.desc.trim().is_empty() {
        digest.push_str(&format!("Search: {}\n\n", query.desc.trim()));
    }
    digest.push_str(&format!("Found {} deals.\n\n", deals.len()));
    for deal in deals {
        digest.push_str(&format!("{deal}\n\n"));
    }
    digest
}
