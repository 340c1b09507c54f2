//! Portal marketplace adapter.
//!
//! Expresses the listing feed, floor prices, collection statistics and the
//! buy endpoint on top of the `Gateway`.
//!
//! Endpoints (relative to the gateway base URL):
//! - `GET  /nfts?...&sort_by=listed_at+desc&status=listed`: newest listings
//! - `GET  /collections/filters?short_names=..`: per-model floor prices
//! - `GET  /collections?offset=0&limit=150`: 24h sales per collection
//! - `GET  /collections/{id}/metrics?group_by=day&from=..&to=..`: daily sales
//! - `GET  /market/actions/?collection_id=..&action_types=buy`: recent sales
//! - `POST /nfts` with `{"nft_details": [{"id": .., "price": ".."}]}`: buy
//!
//! Floors and statistics change slowly and are cached between ticks. The
//! listing feed itself is never cached.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Gateway, Marketplace};
use crate::config::CollectionConfig;
use crate::types::{BuyReceipt, FeedSnapshot, GatewayError, Listing, MarketStats};

const MARKETPLACE_NAME: &str = "portal";

/// Limit for the collection list request.
const COLLECTIONS_LIMIT: u32 = 150;

/// Limit for the sales history request.
const SALES_HISTORY_LIMIT: u32 = 200;

// ---------------------------------------------------------------------------
// Settings and caches
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PortalSettings {
    pub top_n: u32,
    pub fee_rate: Decimal,
    pub floor_ttl: Duration,
    pub stats_ttl: Duration,
    pub trending_threshold: f64,
}

/// Floor price per collection slug, then per model.
pub type FloorTable = HashMap<String, HashMap<String, Decimal>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionActivity {
    pub sales_24h: Decimal,
    pub trending: bool,
    /// 24h sales per model. `None` when the sales history was unavailable.
    pub model_sales: Option<HashMap<String, Decimal>>,
}

impl CollectionActivity {
    /// Sales velocity for one model. A model missing from a known history
    /// sold nothing; without history the collection-wide count stands in.
    pub fn velocity_for(&self, model: &str) -> Decimal {
        match &self.model_sales {
            Some(by_model) => by_model.get(model).copied().unwrap_or(Decimal::ZERO),
            None => self.sales_24h,
        }
    }
}

#[derive(Debug)]
struct Cached<T> {
    value: Arc<T>,
    fetched_at: Instant,
    observed_at: DateTime<Utc>,
}

impl<T> Cached<T> {
    fn new(value: T) -> Self {
        Self {
            value: Arc::new(value),
            fetched_at: Instant::now(),
            observed_at: Utc::now(),
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

type Slot<T> = Mutex<Option<Cached<T>>>;

fn lock<T>(slot: &Slot<T>) -> MutexGuard<'_, Option<Cached<T>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct PortalClient {
    gateway: Arc<Gateway>,
    collections: Vec<CollectionConfig>,
    settings: PortalSettings,
    floors: Slot<FloorTable>,
    activity: Slot<HashMap<String, CollectionActivity>>,
}

impl PortalClient {
    pub fn new(
        gateway: Arc<Gateway>,
        collections: Vec<CollectionConfig>,
        settings: PortalSettings,
    ) -> Self {
        Self {
            gateway,
            collections,
            settings,
            floors: Mutex::new(None),
            activity: Mutex::new(None),
        }
    }

    fn listings_path(&self) -> String {
        let slugs = join_encoded(self.collections.iter().map(|c| c.short_name.as_str()));
        let models = join_encoded(
            self.collections
                .iter()
                .flat_map(|c| c.models.iter().map(String::as_str)),
        );
        format!(
            "/nfts?offset=0&limit={}&filter_by_collections={}&filter_by_models={}\
             &sort_by=listed_at+desc&status=listed&premarket_status=all",
            self.settings.top_n, slugs, models,
        )
    }

    async fn fetch_listings(&self) -> Result<Vec<Value>, GatewayError> {
        let body: Value = self.gateway.get_json(&self.listings_path()).await?;
        match body.get("results").and_then(Value::as_array) {
            Some(items) => Ok(items.clone()),
            None => Err(GatewayError::Malformed(
                "listing feed response has no results array".to_string(),
            )),
        }
    }

    /// Floor table and when it was fetched. A failed refresh falls back to
    /// the previous table so its age drives the staleness check; auth
    /// failures always propagate.
    async fn floors(&self) -> Result<(Arc<FloorTable>, DateTime<Utc>), GatewayError> {
        if let Some(cached) = lock(&self.floors).as_ref() {
            if cached.is_fresh(self.settings.floor_ttl) {
                return Ok((cached.value.clone(), cached.observed_at));
            }
        }

        let path = format!(
            "/collections/filters?short_names={}",
            join_encoded(self.collections.iter().map(|c| c.short_name.as_str()))
        );
        match self.gateway.get_json::<Value>(&path).await {
            Ok(body) => {
                let table = parse_floor_prices(&body);
                debug!(collections = table.len(), "Floor prices refreshed");
                let cached = Cached::new(table);
                let result = (cached.value.clone(), cached.observed_at);
                *lock(&self.floors) = Some(cached);
                Ok(result)
            }
            Err(e @ (GatewayError::AuthExpired { .. } | GatewayError::AuthInvalid(_))) => Err(e),
            Err(e) => match lock(&self.floors).as_ref() {
                Some(stale) => {
                    warn!(error = %e, "Floor refresh failed, using previous floors");
                    Ok((stale.value.clone(), stale.observed_at))
                }
                None => Err(e),
            },
        }
    }

    /// Sales velocity and trending flags. Per-model velocity comes from the
    /// sales history; failures degrade to the collection-wide count, then to
    /// zero velocity and not trending.
    async fn activity(&self) -> Arc<HashMap<String, CollectionActivity>> {
        if let Some(cached) = lock(&self.activity).as_ref() {
            if cached.is_fresh(self.settings.stats_ttl) {
                return cached.value.clone();
            }
        }

        let sales = match self
            .gateway
            .get_json::<Value>(&format!("/collections?offset=0&limit={COLLECTIONS_LIMIT}"))
            .await
        {
            Ok(body) => parse_collection_sales(&body),
            Err(e) => {
                warn!(error = %e, "Collection stats unavailable");
                HashMap::new()
            }
        };

        let now = Utc::now();
        let from =
            urlencoding::encode(&(now - chrono::Duration::days(2)).to_rfc3339()).into_owned();
        let to = urlencoding::encode(&now.to_rfc3339()).into_owned();
        let fetched = futures::future::join_all(self.collections.iter().map(|c| {
            let id = urlencoding::encode(&c.id).into_owned();
            let metrics_path =
                format!("/collections/{id}/metrics?group_by=day&from={from}&to={to}");
            let history_path = format!(
                "/market/actions/?collection_id={id}&action_types=buy\
                 &offset=0&limit={SALES_HISTORY_LIMIT}"
            );
            async move {
                let (metrics, history) = tokio::join!(
                    self.gateway.get_json::<Value>(&metrics_path),
                    self.gateway.get_json::<Value>(&history_path),
                );
                (c, metrics, history)
            }
        }))
        .await;

        let mut activity = HashMap::new();
        for (collection, metrics, history) in fetched {
            let slug = collection.short_name.to_lowercase();
            let (recent, score) = match metrics {
                Ok(body) => parse_metrics(&body, now),
                Err(e) => {
                    debug!(collection = %slug, error = %e, "Collection metrics unavailable");
                    (Decimal::ZERO, 1.0)
                }
            };
            let model_sales = match history {
                Ok(body) => Some(parse_model_sales(&body, now)),
                Err(e) => {
                    debug!(collection = %slug, error = %e, "Sales history unavailable");
                    None
                }
            };
            let sales_24h = sales.get(&slug).copied().unwrap_or(recent);
            activity.insert(
                slug,
                CollectionActivity {
                    sales_24h,
                    trending: score >= self.settings.trending_threshold,
                    model_sales,
                },
            );
        }

        let cached = Cached::new(activity);
        let value = cached.value.clone();
        *lock(&self.activity) = Some(cached);
        value
    }

    fn resolve_collection(&self, key: &str) -> Option<&CollectionConfig> {
        self.collections
            .iter()
            .find(|c| c.id == key || c.short_name.eq_ignore_ascii_case(key))
    }
}

#[async_trait]
impl Marketplace for PortalClient {
    async fn fetch_snapshot(&self) -> Result<FeedSnapshot, GatewayError> {
        let (items, floors, activity) =
            tokio::join!(self.fetch_listings(), self.floors(), self.activity());
        let items = items?;
        let (floors, floors_at) = floors?;

        let observed_at = Utc::now();
        let mut listings = Vec::with_capacity(items.len());
        for item in &items {
            let raw = match parse_listing(item) {
                Ok(raw) => raw,
                Err(reason) => {
                    warn!(reason = %reason, "Skipping malformed listing");
                    continue;
                }
            };
            let slug = self
                .resolve_collection(&raw.collection_key)
                .map(|c| c.short_name.to_lowercase())
                .unwrap_or_else(|| raw.collection_key.to_lowercase());
            let floor_price = floors
                .get(&slug)
                .and_then(|models| models.get(&raw.model))
                .copied();
            let (velocity, trending) = activity
                .get(&slug)
                .map(|a| (a.velocity_for(&raw.model), a.trending))
                .unwrap_or((Decimal::ZERO, false));

            listings.push(Listing {
                id: raw.id,
                collection_id: raw.collection_key,
                collection: slug,
                name: raw.name,
                price: raw.price,
                floor_price,
                model: raw.model,
                velocity,
                trending,
                observed_at,
            });
        }

        let stats = self
            .collections
            .iter()
            .map(|c| {
                (
                    c.short_name.to_lowercase(),
                    MarketStats {
                        fee_rate: self.settings.fee_rate,
                        floor_observed_at: Some(floors_at),
                    },
                )
            })
            .collect();

        Ok(FeedSnapshot {
            listings,
            stats,
            fetched_at: observed_at,
        })
    }

    async fn buy(&self, listing: &Listing) -> Result<BuyReceipt, GatewayError> {
        let payload = json!({
            "nft_details": [
                { "id": listing.id, "price": listing.price.to_string() }
            ]
        });
        info!(listing_id = %listing.id, price = %listing.price, "Sending buy request");
        let resp = self.gateway.post("/nfts", &payload).await?;

        // The response shape is not stable; an order id is recorded when present.
        let order_id = resp.json::<Value>().ok().and_then(|body| {
            ["order_id", "id"]
                .iter()
                .find_map(|k| body.get(*k).and_then(value_to_string))
        });

        Ok(BuyReceipt {
            listing_id: listing.id.clone(),
            price: listing.price,
            order_id,
            dry_run: false,
            timestamp: Utc::now(),
        })
    }

    fn name(&self) -> &str {
        MARKETPLACE_NAME
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// A listing as read from the feed, before floor and stats are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct RawListing {
    pub id: String,
    pub collection_key: String,
    pub model: String,
    pub name: String,
    pub price: Decimal,
}

fn join_encoded<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .map(|p| urlencoding::encode(p).into_owned())
        .collect::<Vec<_>>()
        .join("%2C")
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Prices arrive as JSON numbers or numeric strings.
pub fn parse_decimal(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

pub fn parse_listing(item: &Value) -> Result<RawListing, String> {
    let id = ["id", "address"]
        .iter()
        .find_map(|k| item.get(*k).and_then(value_to_string))
        .ok_or_else(|| "listing has no id".to_string())?;

    let price = item
        .get("price")
        .and_then(parse_decimal)
        .ok_or_else(|| format!("listing {id} has no parseable price"))?;

    let collection_key = ["collection_id", "collection"]
        .iter()
        .find_map(|k| item.get(*k).and_then(value_to_string))
        .unwrap_or_default();

    let model = model_of(item).unwrap_or_else(|| "Unknown".to_string());

    let name = item
        .get("name")
        .and_then(value_to_string)
        .unwrap_or_else(|| "Unknown".to_string());

    Ok(RawListing {
        id,
        collection_key,
        model,
        name,
        price,
    })
}

/// Model comes from the attribute list when present, else a top-level field.
fn model_of(nft: &Value) -> Option<String> {
    nft.get("attributes")
        .and_then(Value::as_array)
        .and_then(|attrs| {
            attrs.iter().find_map(|a| {
                let kind = a.get("type").or_else(|| a.get("trait_type"))?.as_str()?;
                if kind.eq_ignore_ascii_case("model") {
                    a.get("value").and_then(value_to_string)
                } else {
                    None
                }
            })
        })
        .or_else(|| nft.get("model").and_then(value_to_string))
}

/// `{"floor_prices": {slug: {"models": {model: price | null}}}}`
pub fn parse_floor_prices(body: &Value) -> FloorTable {
    let mut table = FloorTable::new();
    let Some(floors) = body.get("floor_prices").and_then(Value::as_object) else {
        return table;
    };
    for (slug, entry) in floors {
        let models = entry
            .get("models")
            .and_then(Value::as_object)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|(model, price)| parse_decimal(price).map(|p| (model.clone(), p)))
                    .collect()
            })
            .unwrap_or_default();
        table.insert(slug.to_lowercase(), models);
    }
    table
}

/// 24h sales per lowercase short name. The list may sit under `results`,
/// `collections` or `data`, or be the body itself.
pub fn parse_collection_sales(body: &Value) -> HashMap<String, Decimal> {
    let items = ["results", "collections", "data"]
        .iter()
        .find_map(|k| body.get(*k).and_then(Value::as_array))
        .or_else(|| body.as_array());

    let mut sales = HashMap::new();
    for item in items.into_iter().flatten() {
        let Some(slug) = item.get("short_name").and_then(Value::as_str) else {
            continue;
        };
        if slug.is_empty() {
            continue;
        }
        let count = item
            .get("sales_count_24h")
            .and_then(parse_decimal)
            .unwrap_or(Decimal::ZERO);
        sales.insert(slug.to_lowercase(), count);
    }
    sales
}

/// Sales in the last 24h and the trending score: last 24h over the 24h
/// before. The score is 1 when there were no earlier sales.
pub fn parse_metrics(body: &Value, now: DateTime<Utc>) -> (Decimal, f64) {
    let cutoff_24h = now - chrono::Duration::hours(24);
    let cutoff_48h = now - chrono::Duration::hours(48);

    let mut last_24h = Decimal::ZERO;
    let mut last_48h = Decimal::ZERO;
    let entries = body
        .get("metrics")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    for entry in entries {
        let Some(date) = entry
            .get("date")
            .and_then(Value::as_str)
            .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
            .map(|d| d.with_timezone(&Utc))
        else {
            continue;
        };
        let sales = entry
            .get("sales_count")
            .and_then(parse_decimal)
            .unwrap_or(Decimal::ZERO);
        if date >= cutoff_24h {
            last_24h = last_24h.saturating_add(sales);
        }
        if date >= cutoff_48h {
            last_48h = last_48h.saturating_add(sales);
        }
    }

    let previous = last_48h.saturating_sub(last_24h);
    let score = if previous > Decimal::ZERO {
        last_24h
            .checked_div(previous)
            .and_then(|ratio| ratio.to_f64())
            .unwrap_or(1.0)
    } else {
        1.0
    };
    (last_24h, score)
}

/// Buys in the last 24h per model, from `{"results": [{"created_at": ..,
/// "nft": {..}}]}`. Entries without a timestamp or model are skipped.
pub fn parse_model_sales(body: &Value, now: DateTime<Utc>) -> HashMap<String, Decimal> {
    let cutoff = now - chrono::Duration::hours(24);
    let mut sales: HashMap<String, Decimal> = HashMap::new();
    let items = body
        .get("results")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    for item in items {
        let recent = item
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
            .is_some_and(|d| d.with_timezone(&Utc) >= cutoff);
        if !recent {
            continue;
        }
        let Some(model) = item.get("nft").and_then(model_of) else {
            continue;
        };
        let count = sales.entry(model).or_insert(Decimal::ZERO);
        *count = count.saturating_add(Decimal::ONE);
    }
    sales
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
