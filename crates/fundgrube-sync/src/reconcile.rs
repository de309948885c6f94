//! Diff freshly crawled postings against stored state.

use std::collections::{HashMap, HashSet};
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fundgrube_core::{DeactivationScope, Page, Posting, PostingFilter};
use fundgrube_storage::{PostingStore, StoreError};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOutcome {
    pub inserted: u64,
    pub updated: u64,
}

/// Counters accumulated over crawl units and reported per shop and per run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CrawlStats {
    pub postings: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deactivated: u64,
    pub api_time: Duration,
    pub store_time: Duration,
}

impl AddAssign for CrawlStats {
    fn add_assign(&mut self, rhs: Self) {
        self.postings += rhs.postings;
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
        self.deactivated += rhs.deactivated;
        self.api_time += rhs.api_time;
        self.store_time += rhs.store_time;
    }
}

impl AddAssign<SaveOutcome> for CrawlStats {
    fn add_assign(&mut self, rhs: SaveOutcome) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
    }
}

pub struct Reconciler {
    store: Arc<dyn PostingStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn PostingStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn PostingStore> {
        &self.store
    }

    /// Write postings that are new or whose content changed; unchanged postings cost no write.
    ///
    /// New postings get `now` as creation and modification time. Changed postings keep
    /// their creation time and get `now` as modification time. A posting listed twice
    /// in the batch is written once, with its last occurrence.
    pub async fn save_new_or_updated(
        &self,
        postings: Vec<Posting>,
        now: DateTime<Utc>,
    ) -> Result<SaveOutcome, StoreError> {
        let postings = dedupe_by_id(postings);
        if postings.is_empty() {
            return Ok(SaveOutcome::default());
        }

        let ids: Vec<String> = postings.iter().map(|p| p.id.clone()).collect();
        let existing: HashMap<String, Posting> = self
            .store
            .find_postings(&PostingFilter::by_ids(ids), Page::first(postings.len()))
            .await?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        let mut outcome = SaveOutcome::default();
        let mut writes = Vec::new();
        for mut fresh in postings {
            match existing.get(&fresh.id) {
                None => {
                    fresh.created_at = Some(now);
                    fresh.modified_at = Some(now);
                    outcome.inserted += 1;
                    writes.push(fresh);
                }
                Some(stored) => {
                    fresh.created_at = stored.created_at;
                    fresh.modified_at = stored.modified_at;
                    if !fresh.same_content(stored) {
                        fresh.created_at = stored.created_at.or(Some(now));
                        fresh.modified_at = Some(now);
                        outcome.updated += 1;
                        writes.push(fresh);
                    }
                }
            }
        }

        self.store.upsert_postings(&writes).await?;
        debug!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            unchanged = existing.len() as u64 - outcome.updated,
            "saved postings"
        );
        Ok(outcome)
    }

    pub async fn deactivate_missing(
        &self,
        scope: &DeactivationScope,
        seen_ids: &HashSet<String>,
    ) -> Result<u64, StoreError> {
        self.store.deactivate_missing(scope, seen_ids).await
    }
}

fn dedupe_by_id(postings: Vec<Posting>) -> Vec<Posting> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(postings.len());
    let mut unique: Vec<Posting> = Vec::with_capacity(postings.len());
    for posting in postings {
        match index.get(&posting.id) {
            Some(&at) => unique[at] = posting,
            None => {
                index.insert(posting.id.clone(), unique.len());
                unique.push(posting);
            }
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{stored_posting, GAMING};
    use chrono::TimeZone;
    use fundgrube_core::{OutletRef, Shop};
    use fundgrube_storage::MemoryStore;

    fn fresh(id: &str, price: f64) -> Posting {
        let mut posting = stored_posting(id, id, price, Utc::now());
        posting.created_at = None;
        posting.modified_at = None;
        posting
    }

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 11, 1, hour, 0, 0).unwrap()
    }

    fn reconciler() -> (Arc<MemoryStore>, Reconciler) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), Reconciler::new(store))
    }

    #[tokio::test]
    async fn second_identical_batch_writes_nothing() {
        let (store, reconciler) = reconciler();
        let batch = vec![fresh("a", 1.0), fresh("b", 2.0)];

        let first = reconciler.save_new_or_updated(batch.clone(), t(1)).await.unwrap();
        assert_eq!(first, SaveOutcome { inserted: 2, updated: 0 });

        let second = reconciler.save_new_or_updated(batch, t(2)).await.unwrap();
        assert_eq!(second, SaveOutcome::default());

        let stored = store.find_posting("a").await.unwrap().unwrap();
        assert_eq!(stored.created_at, Some(t(1)));
        assert_eq!(stored.modified_at, Some(t(1)));
    }

    #[tokio::test]
    async fn changed_posting_bumps_modification_only() {
        let (store, reconciler) = reconciler();
        reconciler.save_new_or_updated(vec![fresh("a", 10.0)], t(1)).await.unwrap();

        let outcome = reconciler
            .save_new_or_updated(vec![fresh("a", 8.0)], t(2))
            .await
            .unwrap();
        assert_eq!(outcome, SaveOutcome { inserted: 0, updated: 1 });

        let stored = store.find_posting("a").await.unwrap().unwrap();
        assert_eq!(stored.price, 8.0);
        assert_eq!(stored.created_at, Some(t(1)));
        assert_eq!(stored.modified_at, Some(t(2)));
    }

    #[tokio::test]
    async fn reappearing_posting_is_reactivated() {
        let (store, reconciler) = reconciler();
        reconciler.save_new_or_updated(vec![fresh("a", 1.0)], t(1)).await.unwrap();
        let scope = DeactivationScope::for_group(Shop::MediaMarkt, GAMING, &[]);
        let deactivated = reconciler
            .deactivate_missing(&scope, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(deactivated, 1);
        assert!(!store.find_posting("a").await.unwrap().unwrap().active);

        let outcome = reconciler
            .save_new_or_updated(vec![fresh("a", 1.0)], t(3))
            .await
            .unwrap();
        assert_eq!(outcome.updated, 1);
        let stored = store.find_posting("a").await.unwrap().unwrap();
        assert!(stored.active);
        assert_eq!(stored.modified_at, Some(t(3)));
    }

    #[tokio::test]
    async fn duplicates_within_a_batch_are_written_once() {
        let (store, reconciler) = reconciler();
        let outcome = reconciler
            .save_new_or_updated(vec![fresh("a", 1.0), fresh("b", 2.0), fresh("a", 3.0)], t(1))
            .await
            .unwrap();
        assert_eq!(outcome, SaveOutcome { inserted: 2, updated: 0 });
        assert_eq!(store.len().await, 2);
        assert_eq!(store.find_posting("a").await.unwrap().unwrap().price, 3.0);
    }

    #[tokio::test]
    async fn deactivation_stays_inside_the_outlet_group() {
        let (store, reconciler) = reconciler();
        let mut elsewhere = fresh("elsewhere", 1.0);
        elsewhere.outlet = OutletRef {
            id: 1200,
            name: "Hamburg".into(),
        };
        reconciler
            .save_new_or_updated(vec![fresh("kept", 1.0), fresh("gone", 2.0), elsewhere], t(1))
            .await
            .unwrap();

        let group = [fundgrube_core::Outlet {
            id: 475,
            name: "Lübeck".into(),
            count: 1,
        }];
        let scope = DeactivationScope::for_group(Shop::MediaMarkt, GAMING, &group);
        let seen = HashSet::from(["kept".to_string()]);
        assert_eq!(reconciler.deactivate_missing(&scope, &seen).await.unwrap(), 1);

        assert!(store.find_posting("kept").await.unwrap().unwrap().active);
        assert!(!store.find_posting("gone").await.unwrap().unwrap().active);
        assert!(store.find_posting("elsewhere").await.unwrap().unwrap().active);
    }

    #[test]
    fn stats_accumulate() {
        let mut total = CrawlStats::default();
        total += CrawlStats {
            postings: 3,
            deactivated: 1,
            api_time: Duration::from_millis(5),
            ..CrawlStats::default()
        };
        total += SaveOutcome { inserted: 2, updated: 1 };
        total += CrawlStats {
            postings: 1,
            store_time: Duration::from_millis(7),
            ..CrawlStats::default()
        };
        assert_eq!(total.postings, 4);
        assert_eq!(total.inserted, 2);
        assert_eq!(total.updated, 1);
        assert_eq!(total.deactivated, 1);
        assert_eq!(total.api_time + total.store_time, Duration::from_millis(12));
    }
}
