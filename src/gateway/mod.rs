//! HTTP gateway to the marketplace.
//!
//! Every call goes through `Gateway::request`, which:
//! - draws a slot from the bounded pool (waiting out any cooldown),
//! - reads the current token from the `TokenManager` just before sending,
//! - classifies the response into success or a typed `GatewayError`.
//!
//! The `Marketplace` trait sits on top and is what the engine talks to.

pub mod pool;
pub mod portal;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::TokenManager;
use crate::types::{BuyReceipt, FeedSnapshot, GatewayError, Listing};
use pool::SlotPool;

// ---------------------------------------------------------------------------
// Marketplace seam
// ---------------------------------------------------------------------------

/// What the engine needs from a marketplace.
#[async_trait]
pub trait Marketplace: Send + Sync {
    /// Current listings plus per-collection stats.
    async fn fetch_snapshot(&self) -> Result<FeedSnapshot, GatewayError>;

    /// Buy one listing at its asking price.
    async fn buy(&self, listing: &Listing) -> Result<BuyReceipt, GatewayError>;

    /// Marketplace name for logging.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Response classification
// ---------------------------------------------------------------------------

/// How a status code is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    AuthExpired,
    RateLimited,
    ClientError,
}

pub fn classify(status: u16) -> ResponseClass {
    match status {
        200..=299 => ResponseClass::Success,
        401 => ResponseClass::AuthExpired,
        429 => ResponseClass::RateLimited,
        500..=599 => ResponseClass::RateLimited,
        _ => ResponseClass::ClientError,
    }
}

/// Larger `Retry-After` values are treated as garbage.
const MAX_RETRY_AFTER_SECS: f64 = 3600.0;

/// `Retry-After` in seconds (integer or fractional). HTTP-date values are
/// not supported and fall back to the default cooldown.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    let secs: f64 = value?.trim().parse().ok()?;
    if secs.is_finite() && (0.0..=MAX_RETRY_AFTER_SECS).contains(&secs) {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    parse_retry_after(headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()))
}

fn truncate(body: &str, max: usize) -> String {
    match body.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &body[..idx]),
        None => body.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub base_url: String,
    pub pool_size: usize,
    pub request_timeout: Duration,
    pub default_cooldown: Duration,
    pub user_agent: String,
}

/// A successful (2xx) response.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: String,
}

impl GatewayResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        serde_json::from_str(&self.body).map_err(|e| GatewayError::Malformed(e.to_string()))
    }
}

pub struct Gateway {
    http: Client,
    base_url: String,
    tokens: Arc<TokenManager>,
    pool: SlotPool,
    default_cooldown: Duration,
}

impl Gateway {
    pub fn new(
        settings: &GatewaySettings,
        tokens: Arc<TokenManager>,
    ) -> Result<Self, GatewayError> {
        let pool_size = settings.pool_size.max(1);
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json, text/plain, */*"),
        );

        let http = Client::builder()
            .timeout(settings.request_timeout)
            .pool_max_idle_per_host(pool_size)
            .user_agent(settings.user_agent.clone())
            .default_headers(headers)
            .build()
            .map_err(|e| GatewayError::Network(format!("failed to build HTTP client: {e}")))?;

        let pool = SlotPool::new(pool_size);
        let base_url = settings.base_url.trim_end_matches('/').to_string();
        debug!(base_url = %base_url, pool_size = pool.size(), "Gateway ready");

        Ok(Self {
            http,
            base_url,
            tokens,
            pool,
            default_cooldown: settings.default_cooldown,
        })
    }

    /// Send one request and classify the outcome.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<GatewayResponse, GatewayError> {
        let mut slot = self.pool.acquire().await?;
        // Read after the slot wait so a refresh that landed meanwhile is used.
        let token = self.tokens.current().await?;

        let url = format!("{}{}", self.base_url, path);
        debug!(
            method = %method,
            url = %url,
            slot = slot.id(),
            idle_slots = self.pool.available(),
            generation = token.generation,
            "Gateway request"
        );

        let mut req = self
            .http
            .request(method.clone(), &url)
            .header(AUTHORIZATION, token.expose());
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        let status = resp.status().as_u16();
        let retry_after = retry_after_header(resp.headers());
        let text = resp
            .text()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        match classify(status) {
            ResponseClass::Success => Ok(GatewayResponse { status, body: text }),
            ResponseClass::AuthExpired => {
                debug!(url = %url, generation = token.generation, "Token rejected (401)");
                Err(GatewayError::AuthExpired {
                    generation: token.generation,
                })
            }
            ResponseClass::RateLimited => {
                let cooldown = retry_after.unwrap_or(self.default_cooldown);
                slot.cool_down(cooldown);
                warn!(
                    url = %url,
                    status,
                    slot = slot.id(),
                    cooldown_ms = cooldown.as_millis() as u64,
                    "Rate limited"
                );
                Err(GatewayError::RateLimited {
                    status,
                    retry_after: cooldown,
                })
            }
            ResponseClass::ClientError => Err(GatewayError::Client {
                status,
                body: truncate(&text, 200),
            }),
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        self.request(Method::GET, path, None).await?.json()
    }

    pub async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<GatewayResponse, GatewayError> {
        self.request(Method::POST, path, Some(body)).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
