//! Core domain model for the outlet crawler: postings, saved queries and search watermarks.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "fundgrube-core";

/// Query parameters appended to every image URL so the CDN renders a fixed-size preview.
pub const IMAGE_RENDER_PARAMS: &str = "strip=yes&quality=75&backgroundsize=cover&x=640&y=640";

/// Current time truncated to milliseconds, the resolution every store round-trips exactly.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Retail chains whose outlet listings are crawled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Shop {
    #[serde(rename = "SATURN")]
    Saturn,
    #[serde(rename = "MM")]
    MediaMarkt,
}

impl Shop {
    pub const ALL: [Shop; 2] = [Shop::Saturn, Shop::MediaMarkt];

    pub fn as_str(&self) -> &'static str {
        match self {
            Shop::Saturn => "SATURN",
            Shop::MediaMarkt => "MM",
        }
    }

    /// Human-facing listing page; postings link here with their filters applied.
    pub fn site_base_url(&self) -> &'static str {
        match self {
            Shop::Saturn => "https://www.saturn.de/de/data/fundgrube",
            Shop::MediaMarkt => "https://www.mediamarkt.de/de/data/fundgrube",
        }
    }

    pub fn api_base_url(&self) -> &'static str {
        match self {
            Shop::Saturn => "https://www.saturn.de/de/data/fundgrube/api/postings",
            Shop::MediaMarkt => "https://www.mediamarkt.de/de/data/fundgrube/api/postings",
        }
    }
}

impl fmt::Display for Shop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown shop `{0}`")]
pub struct UnknownShop(pub String);

impl FromStr for Shop {
    type Err = UnknownShop;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SATURN" => Ok(Shop::Saturn),
            "MM" | "MEDIAMARKT" => Ok(Shop::MediaMarkt),
            other => Err(UnknownShop(other.to_string())),
        }
    }
}

/// Outlet reference embedded in a posting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutletRef {
    #[serde(default)]
    pub id: i32,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrandRef {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Outlet as reported by the listing API; `count` only drives batching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outlet {
    pub id: i32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub count: u32,
}

impl Outlet {
    pub fn to_ref(&self) -> OutletRef {
        OutletRef {
            id: self.id,
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub count: u32,
}

impl Category {
    pub fn to_ref(&self) -> CategoryRef {
        CategoryRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

/// Canonical stored posting.
///
/// `active == false` is a soft delete: the posting was missing from the latest
/// full crawl of its (shop, category, outlet) scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub text: String,
    pub price: f64,
    pub price_old: f64,
    pub discount_in_percent: i32,
    #[serde(default)]
    pub shipping_cost: f64,
    #[serde(default)]
    pub shipping_type: String,
    #[serde(default)]
    pub pim_id: Option<i64>,
    #[serde(default)]
    pub urls: Vec<String>,
    pub outlet: OutletRef,
    #[serde(default)]
    pub brand: BrandRef,
    #[serde(default)]
    pub category: CategoryRef,
    pub shop: Shop,
    #[serde(default)]
    pub shop_url: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl Posting {
    /// Field-for-field equality ignoring `created_at` and `modified_at`.
    pub fn same_content(&self, other: &Posting) -> bool {
        let Posting {
            id,
            name,
            text,
            price,
            price_old,
            discount_in_percent,
            shipping_cost,
            shipping_type,
            pim_id,
            urls,
            outlet,
            brand,
            category,
            shop,
            shop_url,
            created_at: _,
            modified_at: _,
            active,
        } = self;

        *id == other.id
            && *name == other.name
            && *text == other.text
            && *price == other.price
            && *price_old == other.price_old
            && *discount_in_percent == other.discount_in_percent
            && *shipping_cost == other.shipping_cost
            && *shipping_type == other.shipping_type
            && *pim_id == other.pim_id
            && *urls == other.urls
            && *outlet == other.outlet
            && *brand == other.brand
            && *category == other.category
            && *shop == other.shop
            && *shop_url == other.shop_url
            && *active == other.active
    }
}

impl fmt::Display for Posting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2}€ - {} in {} ({})",
            self.price, self.name, self.outlet.name, self.shop
        )?;
        if let Some(image) = self.urls.first() {
            write!(f, "\n\t{image}")?;
        }
        if !self.shop_url.is_empty() {
            write!(f, "\n\t{}", self.shop_url)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid {field} pattern `{pattern}`")]
    InvalidPattern {
        field: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Saved search authored in the configuration document.
///
/// Every filter is optional; a query without filters matches every active posting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Query {
    pub desc: String,
    pub name_regex: Option<String>,
    pub brand_regex: Option<String>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub discount_min: Option<i32>,
    pub outlet_id: Option<i32>,
    /// Internal batch lookups only; never set from configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    pub find_inactive: bool,
}

impl Query {
    /// Stable identity of the query's filters.
    ///
    /// The description is excluded so renaming a query keeps its watermark;
    /// changing any filter yields a new hash and therefore a fresh search.
    pub fn content_hash(&self) -> String {
        let mut fields: BTreeMap<&'static str, serde_json::Value> = BTreeMap::new();
        fields.insert("brand_regex", serde_json::json!(self.brand_regex));
        fields.insert("discount_min", serde_json::json!(self.discount_min));
        fields.insert("find_inactive", serde_json::json!(self.find_inactive));
        fields.insert("ids", serde_json::json!(self.ids));
        fields.insert("name_regex", serde_json::json!(self.name_regex));
        fields.insert("outlet_id", serde_json::json!(self.outlet_id));
        fields.insert("price_max", serde_json::json!(self.price_max));
        fields.insert("price_min", serde_json::json!(self.price_min));

        let mut hasher = Sha256::new();
        for (key, value) in &fields {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.to_string().as_bytes());
            hasher.update(b";");
        }
        hex::encode(hasher.finalize())
    }

    pub fn label(&self) -> &str {
        if self.desc.trim().is_empty() {
            "<unnamed query>"
        } else {
            self.desc.trim()
        }
    }
}

/// Persisted watermark of a saved query, keyed by [`Query::content_hash`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOperation {
    pub hash: String,
    pub description: String,
    pub query: Query,
    pub searched_at: DateTime<Utc>,
}

impl SearchOperation {
    pub fn for_query(query: &Query, searched_at: DateTime<Utc>) -> Self {
        Self {
            hash: query.content_hash(),
            description: query.desc.clone(),
            query: query.clone(),
            searched_at,
        }
    }
}

/// Limit/offset window for store reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub fn first(limit: usize) -> Self {
        Self { limit, offset: 0 }
    }

    pub fn next(self) -> Self {
        Self {
            limit: self.limit,
            offset: self.offset + self.limit,
        }
    }
}

/// Store-level predicate over postings. Absent fields add no predicate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostingFilter {
    pub ids: Option<Vec<String>>,
    pub name_regex: Option<String>,
    pub brand_regex: Option<String>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub discount_min: Option<i32>,
    pub outlet_id: Option<i32>,
    pub shop: Option<Shop>,
    pub modified_since: Option<DateTime<Utc>>,
    pub include_inactive: bool,
}

impl PostingFilter {
    pub fn from_query(query: &Query, modified_since: Option<DateTime<Utc>>) -> Self {
        Self {
            ids: query.ids.clone(),
            name_regex: query.name_regex.clone(),
            brand_regex: query.brand_regex.clone(),
            price_min: query.price_min,
            price_max: query.price_max,
            discount_min: query.discount_min,
            outlet_id: query.outlet_id,
            shop: None,
            modified_since,
            include_inactive: query.find_inactive,
        }
    }

    /// Bulk lookup by id regardless of active state.
    pub fn by_ids(ids: Vec<String>) -> Self {
        Self {
            ids: Some(ids),
            include_inactive: true,
            ..Self::default()
        }
    }

    pub fn for_shop(shop: Shop) -> Self {
        Self {
            shop: Some(shop),
            include_inactive: true,
            ..Self::default()
        }
    }

    /// Whether a name or brand pattern is set.
    pub fn has_patterns(&self) -> bool {
        self.name_regex.is_some() || self.brand_regex.is_some()
    }

    pub fn matcher(&self) -> Result<PostingMatcher<'_>, QueryError> {
        Ok(PostingMatcher {
            filter: self,
            name: compile_pattern("name", self.name_regex.as_deref())?,
            brand: compile_pattern("brand", self.brand_regex.as_deref())?,
        })
    }
}

fn compile_pattern(
    field: &'static str,
    pattern: Option<&str>,
) -> Result<Option<Regex>, QueryError> {
    pattern
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|source| QueryError::InvalidPattern {
                    field,
                    pattern: p.to_string(),
                    source,
                })
        })
        .transpose()
}

/// A [`PostingFilter`] with its patterns compiled, for in-process evaluation.
#[derive(Debug)]
pub struct PostingMatcher<'a> {
    filter: &'a PostingFilter,
    name: Option<Regex>,
    brand: Option<Regex>,
}

impl PostingMatcher<'_> {
    pub fn matches(&self, posting: &Posting) -> bool {
        let f = self.filter;
        if !f.include_inactive && !posting.active {
            return false;
        }
        if let Some(ids) = &f.ids {
            if !ids.iter().any(|id| *id == posting.id) {
                return false;
            }
        }
        if let Some(shop) = f.shop {
            if posting.shop != shop {
                return false;
            }
        }
        if let Some(since) = f.modified_since {
            match posting.modified_at {
                Some(modified) if modified >= since => {}
                _ => return false,
            }
        }
        if let Some(re) = &self.name {
            if !re.is_match(&posting.name) {
                return false;
            }
        }
        if let Some(re) = &self.brand {
            if !re.is_match(&posting.brand.name) {
                return false;
            }
        }
        if f.price_min.is_some_and(|min| posting.price < min) {
            return false;
        }
        if f.price_max.is_some_and(|max| posting.price > max) {
            return false;
        }
        if f.discount_min.is_some_and(|min| posting.discount_in_percent < min) {
            return false;
        }
        if f.outlet_id.is_some_and(|outlet| posting.outlet.id != outlet) {
            return false;
        }
        true
    }
}

/// Which outlets of a (shop, category) a deactivation pass may touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutletSelector {
    Any,
    In(Vec<i32>),
    NotIn(Vec<i32>),
}

impl OutletSelector {
    pub fn contains(&self, outlet_id: i32) -> bool {
        match self {
            OutletSelector::Any => true,
            OutletSelector::In(ids) => ids.contains(&outlet_id),
            OutletSelector::NotIn(ids) => !ids.contains(&outlet_id),
        }
    }
}

/// The slice of stored postings one crawl unit is authoritative for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeactivationScope {
    pub shop: Shop,
    pub category_id: String,
    pub outlets: OutletSelector,
}

impl DeactivationScope {
    /// Scope of an outlet group; an empty group means the whole category.
    pub fn for_group(shop: Shop, category_id: impl Into<String>, outlets: &[Outlet]) -> Self {
        let outlets = if outlets.is_empty() {
            OutletSelector::Any
        } else {
            OutletSelector::In(outlets.iter().map(|o| o.id).collect())
        };
        Self {
            shop,
            category_id: category_id.into(),
            outlets,
        }
    }

    pub fn covers(&self, posting: &Posting) -> bool {
        posting.shop == self.shop
            && posting.category.id == self.category_id
            && self.outlets.contains(posting.outlet.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn mk_posting(id: &str, name: &str, price: f64) -> Posting {
        Posting {
            id: id.to_string(),
            name: name.to_string(),
            text: String::new(),
            price,
            price_old: price * 2.0,
            discount_in_percent: 50,
            shipping_cost: 0.0,
            shipping_type: "shipping".into(),
            pim_id: None,
            urls: vec![format!("https://img/{id}")],
            outlet: OutletRef {
                id: 475,
                name: "Lübeck".into(),
            },
            brand: BrandRef {
                id: 10312,
                name: "Nintendo".into(),
            },
            category: CategoryRef {
                id: "CAT_DE_MM_626".into(),
                name: "Gaming".into(),
            },
            shop: Shop::MediaMarkt,
            shop_url: String::new(),
            created_at: None,
            modified_at: None,
            active: true,
        }
    }

    #[test]
    fn query_hash_is_stable_and_ignores_description() {
        let a = Query {
            desc: "walkman".into(),
            name_regex: Some("sony.*walkman".into()),
            price_max: Some(50.0),
            ..Query::default()
        };
        let mut b = a.clone();
        b.desc = "renamed".into();

        assert_eq!(a.content_hash(), a.clone().content_hash());
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }

    #[test]
    fn query_hash_changes_with_any_filter() {
        let base = Query {
            name_regex: Some("switch".into()),
            ..Query::default()
        };
        let tweaks: [fn(&mut Query); 8] = [
            |q| q.name_regex = Some("switch lite".into()),
            |q| q.brand_regex = Some("nintendo".into()),
            |q| q.price_min = Some(1.0),
            |q| q.price_max = Some(1.0),
            |q| q.discount_min = Some(10),
            |q| q.outlet_id = Some(475),
            |q| q.ids = Some(vec!["a".into()]),
            |q| q.find_inactive = true,
        ];
        for tweak in tweaks {
            let mut variant = base.clone();
            tweak(&mut variant);
            assert_ne!(base.content_hash(), variant.content_hash(), "{variant:?}");
        }
    }

    #[test]
    fn query_hash_does_not_confuse_price_bounds() {
        let min = Query {
            price_min: Some(15.0),
            ..Query::default()
        };
        let max = Query {
            price_max: Some(15.0),
            ..Query::default()
        };
        assert_ne!(min.content_hash(), max.content_hash());
    }

    #[test]
    fn empty_filter_matches_active_postings_only() {
        let filter = PostingFilter::from_query(&Query::default(), None);
        let matcher = filter.matcher().unwrap();
        let mut posting = mk_posting("a", "Instant Chef Party", 10.0);
        assert!(matcher.matches(&posting));
        posting.active = false;
        assert!(!matcher.matches(&posting));

        let filter = PostingFilter::from_query(
            &Query {
                find_inactive: true,
                ..Query::default()
            },
            None,
        );
        assert!(filter.matcher().unwrap().matches(&posting));
        assert!(!filter.has_patterns());
    }

    #[test]
    fn regex_filters_are_case_insensitive() {
        let filter = PostingFilter::from_query(
            &Query {
                name_regex: Some("^.*NINTENDO.*$".into()),
                brand_regex: Some("nin.*o".into()),
                ..Query::default()
            },
            None,
        );
        let matcher = filter.matcher().unwrap();
        let necro = mk_posting("a", "Crypt of the Necrodancer - [Nintendo Switch]", 20.0);
        assert!(matcher.matches(&necro));
        assert!(!matcher.matches(&mk_posting("b", "ASUS Monitor", 20.0)));
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let filter = PostingFilter {
            name_regex: Some("(".into()),
            ..PostingFilter::default()
        };
        let err = filter.matcher().unwrap_err();
        assert_eq!(err.to_string(), "invalid name pattern `(`");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn numeric_and_recency_bounds() {
        let since = Utc.with_ymd_and_hms(2022, 10, 30, 0, 0, 0).unwrap();
        let filter = PostingFilter {
            price_min: Some(15.0),
            price_max: Some(30.0),
            discount_min: Some(40),
            outlet_id: Some(475),
            modified_since: Some(since),
            ..PostingFilter::default()
        };
        let matcher = filter.matcher().unwrap();

        let mut posting = mk_posting("a", "x", 20.0);
        posting.modified_at = Some(since);
        assert!(matcher.matches(&posting));

        posting.modified_at = Some(since - chrono::Duration::seconds(1));
        assert!(!matcher.matches(&posting));

        posting.modified_at = None;
        assert!(!matcher.matches(&posting));

        let mut cheap = mk_posting("b", "x", 10.0);
        cheap.modified_at = Some(since);
        assert!(!matcher.matches(&cheap));

        let mut other_outlet = mk_posting("c", "x", 20.0);
        other_outlet.modified_at = Some(since);
        other_outlet.outlet.id = 1;
        assert!(!matcher.matches(&other_outlet));
    }

    #[test]
    fn same_content_ignores_timestamps_only() {
        let a = mk_posting("a", "x", 1.0);
        let mut b = a.clone();
        b.created_at = Some(Utc::now());
        b.modified_at = Some(Utc::now());
        assert!(a.same_content(&b));

        b.active = false;
        assert!(!a.same_content(&b));
    }

    #[test]
    fn deactivation_scope_for_empty_group_covers_category() {
        let scope = DeactivationScope::for_group(Shop::MediaMarkt, "CAT_DE_MM_626", &[]);
        assert_eq!(scope.outlets, OutletSelector::Any);
        assert!(scope.covers(&mk_posting("a", "x", 1.0)));

        let scope = DeactivationScope::for_group(
            Shop::MediaMarkt,
            "CAT_DE_MM_626",
            &[Outlet { id: 1, name: "1".into(), count: 3 }],
        );
        assert!(!scope.covers(&mk_posting("a", "x", 1.0)));
    }

    #[test]
    fn shop_round_trips_through_its_wire_name() {
        for shop in Shop::ALL {
            assert_eq!(shop.as_str().parse::<Shop>().unwrap(), shop);
        }
        assert_eq!(serde_json::to_string(&Shop::MediaMarkt).unwrap(), "\"MM\"");
        assert!("ALDI".parse::<Shop>().is_err());
    }
}
