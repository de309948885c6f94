//! Listing API client, outlet batching and posting normalization.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fundgrube_core::{
    BrandRef, Category, CategoryRef, Outlet, OutletRef, Posting, Shop, IMAGE_RENDER_PARAMS,
};
use fundgrube_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::form_urlencoded;

pub const CRATE_NAME: &str = "fundgrube-adapters";

/// Largest page the API honours; at 100 and above it silently returns a smaller page.
pub const PAGE_SIZE: usize = 90;

/// The API refuses offsets beyond this value.
pub const MAX_OFFSET: usize = 990;

/// Upper bound of summed outlet posting counts per batch; keeps paging below [`MAX_OFFSET`].
pub const OUTLET_BATCH_LIMIT: u64 = 990;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: usize,
    pub offset: usize,
}

impl PageRequest {
    /// Single-posting request used to read the outlet/category side channel.
    pub const DISCOVERY: PageRequest = PageRequest {
        limit: 1,
        offset: 0,
    };

    pub fn first() -> Self {
        Self {
            limit: PAGE_SIZE,
            offset: 0,
        }
    }
}

/// Filter dimensions of one listing request. Empty lists add no parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingScope {
    pub outlets: Vec<i32>,
    pub categories: Vec<String>,
    pub brand: Option<String>,
}

impl ListingScope {
    pub fn category(category_id: impl Into<String>) -> Self {
        Self {
            categories: vec![category_id.into()],
            ..Self::default()
        }
    }

    pub fn with_outlets(mut self, outlets: &[Outlet]) -> Self {
        self.outlets = outlets.iter().map(|o| o.id).collect();
        self
    }
}

/// Posting record as delivered by the listing API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPosting {
    #[serde(rename = "posting_id")]
    pub id: String,
    #[serde(rename = "posting_text", default)]
    pub text: String,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub price_old: Option<String>,
    #[serde(default)]
    pub shipping_cost: f64,
    #[serde(default)]
    pub shipping_type: String,
    #[serde(default)]
    pub discount_in_percent: i32,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "original_url", default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub outlet: OutletRef,
    #[serde(default)]
    pub brand: BrandRef,
    #[serde(default)]
    pub top_level_catalog_id: String,
    #[serde(default)]
    pub pim_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingPage {
    #[serde(default)]
    pub postings: Vec<RawPosting>,
    #[serde(default)]
    pub outlets: Vec<Outlet>,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(rename = "morePostingsAvailable", default)]
    pub has_more_pages: bool,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding listing response from {url}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading fixture {}", path.display())]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Byte source behind the client: the live API or a canned response.
#[async_trait]
pub trait CatalogTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, url: &str) -> Result<Vec<u8>, CatalogError>;
}

#[derive(Debug)]
pub struct HttpTransport {
    fetcher: HttpFetcher,
}

impl HttpTransport {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            fetcher: HttpFetcher::new(config)?,
        })
    }
}

#[async_trait]
impl CatalogTransport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, CatalogError> {
        Ok(self.fetcher.fetch_bytes(url).await?.body)
    }
}

/// Answers every request with the same fixture file.
#[derive(Debug, Clone)]
pub struct FixtureTransport {
    path: PathBuf,
}

impl FixtureTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CatalogTransport for FixtureTransport {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, CatalogError> {
        debug!(fixture = %self.path.display(), "serving {url} from fixture");
        tokio::fs::read(&self.path)
            .await
            .map_err(|source| CatalogError::Fixture {
                path: self.path.clone(),
                source,
            })
    }
}

/// Pagination state honouring the page size and the offset ceiling.
#[derive(Debug, Clone)]
pub struct PageCursor {
    next: Option<PageRequest>,
}

impl Default for PageCursor {
    fn default() -> Self {
        Self {
            next: Some(PageRequest::first()),
        }
    }
}

impl PageCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peek(&self) -> Option<PageRequest> {
        self.next
    }

    /// Move past the page just fetched. Stops when upstream reports no more pages
    /// or the next offset would exceed [`MAX_OFFSET`], whichever comes first.
    pub fn advance(&mut self, has_more_pages: bool) {
        let Some(current) = self.next.take() else {
            return;
        };
        let offset = current.offset + current.limit;
        if has_more_pages && offset <= MAX_OFFSET {
            self.next = Some(PageRequest {
                limit: current.limit,
                offset,
            });
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.next.is_none()
    }
}

/// All postings of one scope, concatenated in page order.
#[derive(Debug, Clone, Default)]
pub struct FetchedListing {
    pub postings: Vec<RawPosting>,
    pub pages: usize,
    pub elapsed: Duration,
    /// Upstream still had more pages when the offset ceiling stopped paging.
    pub truncated: bool,
}

pub struct CatalogClient {
    transport: Box<dyn CatalogTransport>,
}

impl CatalogClient {
    pub fn new(transport: Box<dyn CatalogTransport>) -> Self {
        Self { transport }
    }

    /// Live API client, or the fixture-backed one when `mocked` is set.
    pub fn for_mode(
        mocked: bool,
        http: HttpClientConfig,
        fixture_path: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        let transport: Box<dyn CatalogTransport> = if mocked {
            Box::new(FixtureTransport::new(fixture_path))
        } else {
            Box::new(HttpTransport::new(http)?)
        };
        Ok(Self::new(transport))
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Fetch one page. Without `page` this is a discovery call: only the
    /// outlet/category side channel is returned, postings are dropped.
    pub async fn fetch_page(
        &self,
        shop: Shop,
        scope: &ListingScope,
        page: Option<PageRequest>,
    ) -> Result<ListingPage, CatalogError> {
        let discovery = page.is_none();
        let request = page.unwrap_or(PageRequest::DISCOVERY);
        let url = build_url(
            shop,
            &scope.outlets,
            &scope.categories,
            scope.brand.as_deref(),
            Some(request),
        );

        let body = self.transport.get(&url).await?;
        let mut listing: ListingPage =
            serde_json::from_slice(&body).map_err(|source| CatalogError::Decode {
                url: url.clone(),
                source,
            })?;

        if discovery {
            listing.postings.clear();
        } else {
            debug!(
                %shop,
                offset = request.offset,
                postings = listing.postings.len(),
                more = listing.has_more_pages,
                "fetched listing page"
            );
        }
        Ok(listing)
    }

    /// Fetch the page `cursor` points at and advance it; `None` once exhausted.
    pub async fn next_page(
        &self,
        shop: Shop,
        scope: &ListingScope,
        cursor: &mut PageCursor,
    ) -> Result<Option<ListingPage>, CatalogError> {
        let Some(request) = cursor.peek() else {
            return Ok(None);
        };
        let page = self.fetch_page(shop, scope, Some(request)).await?;
        cursor.advance(page.has_more_pages);
        Ok(Some(page))
    }

    pub async fn fetch_all(
        &self,
        shop: Shop,
        scope: &ListingScope,
    ) -> Result<FetchedListing, CatalogError> {
        let started = Instant::now();
        let mut cursor = PageCursor::new();
        let mut listing = FetchedListing::default();
        while let Some(page) = self.next_page(shop, scope, &mut cursor).await? {
            listing.pages += 1;
            listing.truncated = page.has_more_pages;
            listing.postings.extend(page.postings);
        }
        listing.elapsed = started.elapsed();
        Ok(listing)
    }
}

pub fn comma_separated<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// API URL when `page` is set, otherwise the shop's human-facing listing URL.
/// Parameters are emitted in key order.
pub fn build_url(
    shop: Shop,
    outlets: &[i32],
    categories: &[String],
    brand: Option<&str>,
    page: Option<PageRequest>,
) -> String {
    let base = match page {
        Some(_) => shop.api_base_url(),
        None => shop.site_base_url(),
    };

    let mut params: Vec<(&str, String)> = Vec::new();
    if let Some(brand) = brand.filter(|b| !b.is_empty()) {
        params.push(("brands", brand.to_string()));
    }
    if !categories.is_empty() {
        params.push(("categorieIds", comma_separated(categories)));
    }
    if let Some(page) = page {
        params.push(("limit", page.limit.to_string()));
        params.push(("offset", page.offset.to_string()));
    }
    if !outlets.is_empty() {
        params.push(("outletIds", comma_separated(outlets)));
    }

    if params.is_empty() {
        return base.to_string();
    }
    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())))
        .finish();
    format!("{base}?{query}")
}

/// Split outlets, in order, into batches whose summed posting counts stay within
/// [`OUTLET_BATCH_LIMIT`]. An outlet that alone exceeds the limit gets its own batch.
pub fn group_outlets(outlets: &[Outlet]) -> Vec<Vec<Outlet>> {
    let mut groups = Vec::new();
    let mut current: Vec<Outlet> = Vec::new();
    let mut running: u64 = 0;

    for outlet in outlets {
        let count = u64::from(outlet.count);
        if !current.is_empty() && running + count > OUTLET_BATCH_LIMIT {
            groups.push(std::mem::take(&mut current));
            running = 0;
        }
        running += count;
        current.push(outlet.clone());
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Lenient price parsing; missing, malformed or non-finite prices become zero.
pub fn parse_price(value: Option<&str>) -> f64 {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|price| price.is_finite())
        .unwrap_or_default()
}

/// Convert an API record into a freshly seen, live posting of `shop` and `category`.
pub fn normalize_posting(shop: Shop, category: &CategoryRef, raw: RawPosting) -> Posting {
    let categories = if category.id.is_empty() {
        Vec::new()
    } else {
        vec![category.id.clone()]
    };
    let shop_url = build_url(
        shop,
        &[raw.outlet.id],
        &categories,
        Some(raw.brand.name.as_str()),
        None,
    );

    Posting {
        price: parse_price(raw.price.as_deref()),
        price_old: parse_price(raw.price_old.as_deref()),
        urls: raw
            .urls
            .into_iter()
            .map(|url| format!("{url}?{IMAGE_RENDER_PARAMS}"))
            .collect(),
        id: raw.id,
        name: raw.name,
        text: raw.text,
        discount_in_percent: raw.discount_in_percent,
        shipping_cost: raw.shipping_cost,
        shipping_type: raw.shipping_type,
        pim_id: raw.pim_id,
        outlet: raw.outlet,
        brand: raw.brand,
        category: category.clone(),
        shop,
        shop_url,
        created_at: None,
        modified_at: None,
        active: true,
    }
}

pub fn normalize_postings(
    shop: Shop,
    category: &CategoryRef,
    raw: Vec<RawPosting>,
) -> Vec<Posting> {
    raw.into_iter()
        .map(|p| normalize_posting(shop, category, p))
        .collect()
}
