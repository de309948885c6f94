use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fundgrube_core::{
    DeactivationScope, OutletSelector, Page, Posting, PostingFilter, PostingMatcher,
    SearchOperation,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::info;

use crate::{require_timestamps, MigrationReport, PostingStore, StoreError};

/// Rows per statement in a bulk upsert; 12 binds per row keeps a chunk under the
/// Postgres limit of 65535 parameters.
const UPSERT_CHUNK: usize = 1000;

type UpsertRow<'a> = (&'a Posting, DateTime<Utc>, DateTime<Utc>);

/// Rows read per round trip while scanning for pattern matches.
const PATTERN_SCAN_BATCH: i64 = 500;

/// Postgres-backed store: the full posting is kept as a JSONB document, with the
/// fields used for filtering, sorting and scoping mirrored into indexed columns.
///
/// Name and brand patterns are evaluated with the `regex` crate after loading,
/// never with `~*`, so patterns mean the same thing as in `MemoryStore`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn push_posting_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &PostingFilter) {
    if let Some(ids) = &filter.ids {
        qb.push(" AND id = ANY(").push_bind(ids.clone()).push(")");
    }
    if let Some(shop) = filter.shop {
        qb.push(" AND shop = ").push_bind(shop.as_str());
    }
    if let Some(since) = filter.modified_since {
        qb.push(" AND mod_dat >= ").push_bind(since);
    }
    if let Some(min) = filter.price_min {
        qb.push(" AND price >= ").push_bind(min);
    }
    if let Some(max) = filter.price_max {
        qb.push(" AND price <= ").push_bind(max);
    }
    if let Some(min) = filter.discount_min {
        qb.push(" AND discount_in_percent >= ").push_bind(min);
    }
    if let Some(outlet) = filter.outlet_id {
        qb.push(" AND outlet_id = ").push_bind(outlet);
    }
    if !filter.include_inactive {
        qb.push(" AND active");
    }
}

fn decode_posting(row: &PgRow) -> Result<Posting, StoreError> {
    let id: String = row.try_get("id")?;
    let doc: serde_json::Value = row.try_get("doc")?;
    serde_json::from_value(doc).map_err(|source| StoreError::MalformedDocument { id, source })
}

impl PgStore {
    /// Walk the price-ordered rows in keyset batches, keeping those the matcher
    /// accepts, until the requested window is filled.
    async fn scan_matching(
        &self,
        filter: &PostingFilter,
        matcher: &PostingMatcher<'_>,
        page: Page,
    ) -> Result<Vec<Posting>, StoreError> {
        let wanted = page.offset + page.limit;
        let mut matched = Vec::new();
        let mut after: Option<(f64, String)> = None;

        while matched.len() < wanted {
            let mut qb =
                QueryBuilder::<Postgres>::new("SELECT id, price, doc FROM postings WHERE TRUE");
            push_posting_filter(&mut qb, filter);
            if let Some((price, id)) = &after {
                qb.push(" AND (price, id) > (")
                    .push_bind(*price)
                    .push(", ")
                    .push_bind(id.clone())
                    .push(")");
            }
            qb.push(" ORDER BY price ASC, id ASC LIMIT ").push_bind(PATTERN_SCAN_BATCH);

            let rows = qb.build().fetch_all(&self.pool).await?;
            let Some(last) = rows.last() else {
                break;
            };
            after = Some((last.try_get("price")?, last.try_get("id")?));
            for row in &rows {
                let posting = decode_posting(row)?;
                if matcher.matches(&posting) {
                    matched.push(posting);
                }
            }
            if (rows.len() as i64) < PATTERN_SCAN_BATCH {
                break;
            }
        }

        Ok(matched
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }
}

#[async_trait]
impl PostingStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn find_posting(&self, id: &str) -> Result<Option<Posting>, StoreError> {
        let row = sqlx::query("SELECT id, doc FROM postings WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_posting).transpose()
    }

    async fn find_postings(
        &self,
        filter: &PostingFilter,
        page: Page,
    ) -> Result<Vec<Posting>, StoreError> {
        let matcher = filter.matcher()?;
        if filter.has_patterns() {
            return self.scan_matching(filter, &matcher, page).await;
        }

        let mut qb = QueryBuilder::<Postgres>::new("SELECT id, doc FROM postings WHERE TRUE");
        push_posting_filter(&mut qb, filter);
        qb.push(" ORDER BY price ASC, id ASC LIMIT ")
            .push_bind(page.limit as i64)
            .push(" OFFSET ")
            .push_bind(page.offset as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(decode_posting).collect()
    }

    async fn upsert_postings(&self, postings: &[Posting]) -> Result<(), StoreError> {
        if postings.is_empty() {
            return Ok(());
        }

        // last occurrence wins; one statement may not touch the same id twice
        let mut rows: Vec<UpsertRow<'_>> = Vec::with_capacity(postings.len());
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(postings.len());
        for posting in postings {
            let (created_at, modified_at) = require_timestamps(posting)?;
            match index.get(posting.id.as_str()) {
                Some(&at) => rows[at] = (posting, created_at, modified_at),
                None => {
                    index.insert(posting.id.as_str(), rows.len());
                    rows.push((posting, created_at, modified_at));
                }
            }
        }

        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(UPSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO postings (id, shop, category_id, outlet_id, name, brand_name, price, \
                 discount_in_percent, active, cre_dat, mod_dat, doc) ",
            );
            qb.push_values(chunk, |mut row, (posting, created_at, modified_at)| {
                row.push_bind(posting.id.clone())
                    .push_bind(posting.shop.as_str())
                    .push_bind(posting.category.id.clone())
                    .push_bind(posting.outlet.id)
                    .push_bind(posting.name.clone())
                    .push_bind(posting.brand.name.clone())
                    .push_bind(posting.price)
                    .push_bind(posting.discount_in_percent)
                    .push_bind(posting.active)
                    .push_bind(*created_at)
                    .push_bind(*modified_at)
                    .push_bind(Json(Posting::clone(posting)));
            });
            qb.push(
                r#"
                ON CONFLICT (id) DO UPDATE
                  SET shop                = EXCLUDED.shop,
                      category_id         = EXCLUDED.category_id,
                      outlet_id           = EXCLUDED.outlet_id,
                      name                = EXCLUDED.name,
                      brand_name          = EXCLUDED.brand_name,
                      price               = EXCLUDED.price,
                      discount_in_percent = EXCLUDED.discount_in_percent,
                      active              = EXCLUDED.active,
                      cre_dat             = EXCLUDED.cre_dat,
                      mod_dat             = EXCLUDED.mod_dat,
                      doc                 = EXCLUDED.doc
                "#,
            );
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn deactivate_missing(
        &self,
        scope: &DeactivationScope,
        seen_ids: &HashSet<String>,
    ) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "UPDATE postings SET active = FALSE, doc = jsonb_set(doc, '{active}', 'false'::jsonb) \
             WHERE active AND shop = ",
        );
        qb.push_bind(scope.shop.as_str())
            .push(" AND category_id = ")
            .push_bind(scope.category_id.clone());

        match &scope.outlets {
            OutletSelector::Any => {}
            OutletSelector::In(ids) => {
                qb.push(" AND outlet_id = ANY(").push_bind(ids.clone()).push(")");
            }
            OutletSelector::NotIn(ids) => {
                qb.push(" AND NOT (outlet_id = ANY(")
                    .push_bind(ids.clone())
                    .push("))");
            }
        }

        if !seen_ids.is_empty() {
            let seen: Vec<String> = seen_ids.iter().cloned().collect();
            qb.push(" AND NOT (id = ANY(").push_bind(seen).push("))");
        }

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete_all_postings(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM postings")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_inactive(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM postings WHERE NOT active AND mod_dat < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn find_search_operation(
        &self,
        hash: &str,
    ) -> Result<Option<SearchOperation>, StoreError> {
        let row = sqlx::query(
            "SELECT hash, description, query, searched_at FROM search_operations WHERE hash = $1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let hash: String = row.try_get("hash")?;
        let query: serde_json::Value = row.try_get("query")?;
        let query = serde_json::from_value(query).map_err(|source| StoreError::MalformedDocument {
            id: hash.clone(),
            source,
        })?;
        Ok(Some(SearchOperation {
            hash,
            description: row.try_get("description")?,
            query,
            searched_at: row.try_get("searched_at")?,
        }))
    }

    async fn save_search_operation(&self, op: &SearchOperation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO search_operations (hash, description, query, searched_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (hash) DO UPDATE
              SET description = EXCLUDED.description,
                  query       = EXCLUDED.query,
                  searched_at = EXCLUDED.searched_at
            "#,
        )
        .bind(&op.hash)
        .bind(&op.description)
        .bind(Json(&op.query))
        .bind(op.searched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn migrate(&self) -> Result<MigrationReport, StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;

        let schema_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM _sqlx_migrations WHERE success")
                .fetch_one(&self.pool)
                .await?;

        // documents written before the active column was authoritative
        let repaired = sqlx::query(
            r#"
            UPDATE postings
               SET doc = jsonb_set(doc, '{active}', to_jsonb(active))
             WHERE (doc ->> 'active') IS DISTINCT FROM active::text
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        info!(?schema_version, documents_repaired = repaired, "postgres store migrated");
        Ok(MigrationReport {
            schema_version,
            documents_repaired: repaired,
        })
    }
}
