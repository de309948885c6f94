//! In-process stand-ins for the listing API and the mail transport.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fundgrube_adapters::{CatalogClient, CatalogError, CatalogTransport, ListingPage, RawPosting};
use fundgrube_core::{BrandRef, Category, CategoryRef, Outlet, OutletRef, Posting, Shop};

use crate::alert::{AlertDispatcher, AlertError};

pub const GAMING: &str = "CAT_DE_MM_626";
pub const MONITORS: &str = "CAT_DE_MM_100";

pub fn raw_posting(id: &str, price: f64, outlet: i32, category: &str) -> RawPosting {
    RawPosting {
        id: id.to_string(),
        text: String::new(),
        price: Some(format!("{price:.2}")),
        price_old: Some(format!("{:.2}", price * 2.0)),
        shipping_cost: 0.0,
        shipping_type: "pickup".into(),
        discount_in_percent: 50,
        name: format!("Posting {id}"),
        urls: vec![format!("https://img.example/{id}")],
        outlet: OutletRef {
            id: outlet,
            name: format!("Outlet {outlet}"),
        },
        brand: BrandRef {
            id: 1,
            name: "Nintendo".into(),
        },
        top_level_catalog_id: category.to_string(),
        pim_id: None,
    }
}

pub fn stored_posting(id: &str, name: &str, price: f64, modified_at: DateTime<Utc>) -> Posting {
    Posting {
        id: id.to_string(),
        name: name.to_string(),
        text: String::new(),
        price,
        price_old: price * 2.0,
        discount_in_percent: 50,
        shipping_cost: 0.0,
        shipping_type: "pickup".into(),
        pim_id: None,
        urls: vec![],
        outlet: OutletRef {
            id: 475,
            name: "Lübeck".into(),
        },
        brand: BrandRef {
            id: 1,
            name: "Nintendo".into(),
        },
        category: CategoryRef {
            id: GAMING.into(),
            name: "Gaming".into(),
        },
        shop: Shop::MediaMarkt,
        shop_url: String::new(),
        created_at: Some(modified_at),
        modified_at: Some(modified_at),
        active: true,
    }
}

#[derive(Default)]
struct FakeState {
    categories: Vec<(String, String)>,
    postings: Vec<(Shop, RawPosting)>,
    requests: Vec<String>,
}

/// Emulates the listing API: filters by category and outlet, reports the outlet and
/// category side channel, pages by limit/offset in price order.
#[derive(Clone, Default)]
pub struct FakeApi {
    state: Arc<Mutex<FakeState>>,
}

impl FakeApi {
    pub fn new() -> Self {
        let api = Self::default();
        api.add_category(GAMING, "Gaming");
        api.add_category(MONITORS, "Monitors");
        api
    }

    pub fn client(&self) -> CatalogClient {
        CatalogClient::new(Box::new(self.clone()))
    }

    pub fn add_category(&self, id: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .categories
            .push((id.to_string(), name.to_string()));
    }

    pub fn list(&self, shop: Shop, posting: RawPosting) {
        self.state.lock().unwrap().postings.push((shop, posting));
    }

    pub fn delist(&self, id: &str) {
        self.state.lock().unwrap().postings.retain(|(_, p)| p.id != id);
    }

    pub fn reprice(&self, id: &str, price: f64) {
        let mut state = self.state.lock().unwrap();
        for (_, posting) in state.postings.iter_mut().filter(|(_, p)| p.id == id) {
            posting.price = Some(format!("{price:.2}"));
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }
}

fn price_of(posting: &RawPosting) -> f64 {
    posting
        .price
        .as_deref()
        .and_then(|p| p.parse().ok())
        .unwrap_or_default()
}

#[async_trait]
impl CatalogTransport for FakeApi {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, CatalogError> {
        let parsed = url::Url::parse(url).unwrap();
        let shop = if parsed.host_str().unwrap_or_default().contains("saturn") {
            Shop::Saturn
        } else {
            Shop::MediaMarkt
        };
        let params: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
        let list = |key: &str| -> Vec<String> {
            params
                .get(key)
                .map(|v| v.split(',').map(str::to_string).collect())
                .unwrap_or_default()
        };
        let categories = list("categorieIds");
        let outlets: Vec<i32> = list("outletIds").iter().map(|o| o.parse().unwrap()).collect();
        let limit: usize = params.get("limit").map(|v| v.parse().unwrap()).unwrap_or(90);
        let offset: usize = params.get("offset").map(|v| v.parse().unwrap()).unwrap_or(0);

        let mut state = self.state.lock().unwrap();
        state.requests.push(url.to_string());

        let in_shop: Vec<&RawPosting> = state
            .postings
            .iter()
            .filter(|(s, _)| *s == shop)
            .map(|(_, p)| p)
            .collect();
        let in_category: Vec<&RawPosting> = in_shop
            .iter()
            .copied()
            .filter(|p| categories.is_empty() || categories.contains(&p.top_level_catalog_id))
            .collect();

        let mut outlet_counts: BTreeMap<i32, Outlet> = BTreeMap::new();
        for posting in &in_category {
            outlet_counts
                .entry(posting.outlet.id)
                .or_insert_with(|| Outlet {
                    id: posting.outlet.id,
                    name: posting.outlet.name.clone(),
                    count: 0,
                })
                .count += 1;
        }
        let category_list: Vec<Category> = state
            .categories
            .iter()
            .map(|(id, name)| Category {
                id: id.clone(),
                name: name.clone(),
                count: in_shop.iter().filter(|p| p.top_level_catalog_id == *id).count() as u32,
            })
            .collect();

        let mut selected: Vec<RawPosting> = in_category
            .into_iter()
            .filter(|p| outlets.is_empty() || outlets.contains(&p.outlet.id))
            .cloned()
            .collect();
        selected.sort_by(|a, b| price_of(a).total_cmp(&price_of(b)).then_with(|| a.id.cmp(&b.id)));
        let total = selected.len();

        let page = ListingPage {
            postings: selected.into_iter().skip(offset).take(limit).collect(),
            outlets: outlet_counts.into_values().collect(),
            categories: category_list,
            has_more_pages: offset + limit < total,
        };
        Ok(serde_json::to_vec(&page).unwrap())
    }
}

#[derive(Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingDispatcher {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertDispatcher for RecordingDispatcher {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn dispatch(&self, subject: &str, body: &[u8]) -> Result<(), AlertError> {
        self.sent
            .lock()
            .unwrap()
            .push((subject.to_string(), String::from_utf8_lossy(body).into_owned()));
        Ok(())
    }
}

pub struct FailingDispatcher;

#[async_trait]
impl AlertDispatcher for FailingDispatcher {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn dispatch(&self, _subject: &str, _body: &[u8]) -> Result<(), AlertError> {
        let address = "postmaster".to_string();
        let source = address.parse::<lettre::message::Mailbox>().unwrap_err();
        Err(AlertError::Address { address, source })
    }
}
