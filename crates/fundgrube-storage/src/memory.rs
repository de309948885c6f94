use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fundgrube_core::{DeactivationScope, Page, Posting, PostingFilter, SearchOperation};
use tokio::sync::Mutex;

use crate::{require_timestamps, MigrationReport, PostingStore, StoreError};

/// In-process store with the same semantics as `PgStore`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    postings: Mutex<BTreeMap<String, Posting>>,
    operations: Mutex<HashMap<String, SearchOperation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.postings.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.postings.lock().await.is_empty()
    }
}

#[async_trait]
impl PostingStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn find_posting(&self, id: &str) -> Result<Option<Posting>, StoreError> {
        Ok(self.postings.lock().await.get(id).cloned())
    }

    async fn find_postings(
        &self,
        filter: &PostingFilter,
        page: Page,
    ) -> Result<Vec<Posting>, StoreError> {
        let matcher = filter.matcher()?;
        let postings = self.postings.lock().await;
        let mut matched: Vec<&Posting> = postings.values().filter(|p| matcher.matches(p)).collect();
        matched.sort_by(|a, b| a.price.total_cmp(&b.price).then_with(|| a.id.cmp(&b.id)));
        Ok(matched
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn upsert_postings(&self, postings: &[Posting]) -> Result<(), StoreError> {
        for posting in postings {
            require_timestamps(posting)?;
        }
        let mut stored = self.postings.lock().await;
        for posting in postings {
            stored.insert(posting.id.clone(), posting.clone());
        }
        Ok(())
    }

    async fn deactivate_missing(
        &self,
        scope: &DeactivationScope,
        seen_ids: &HashSet<String>,
    ) -> Result<u64, StoreError> {
        let mut stored = self.postings.lock().await;
        let mut deactivated = 0;
        for posting in stored.values_mut() {
            if posting.active && scope.covers(posting) && !seen_ids.contains(&posting.id) {
                posting.active = false;
                deactivated += 1;
            }
        }
        Ok(deactivated)
    }

    async fn delete_all_postings(&self) -> Result<u64, StoreError> {
        let mut stored = self.postings.lock().await;
        let removed = stored.len() as u64;
        stored.clear();
        Ok(removed)
    }

    async fn purge_inactive(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut stored = self.postings.lock().await;
        let size_before = stored.len();
        stored.retain(|_, p| p.active || p.modified_at.is_some_and(|m| m >= before));
        Ok((size_before - stored.len()) as u64)
    }

    async fn find_search_operation(
        &self,
        hash: &str,
    ) -> Result<Option<SearchOperation>, StoreError> {
        Ok(self.operations.lock().await.get(hash).cloned())
    }

    async fn save_search_operation(&self, op: &SearchOperation) -> Result<(), StoreError> {
        self.operations
            .lock()
            .await
            .insert(op.hash.clone(), op.clone());
        Ok(())
    }

    async fn migrate(&self) -> Result<MigrationReport, StoreError> {
        Ok(MigrationReport::default())
    }
}
