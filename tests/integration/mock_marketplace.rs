//! Mock marketplace for integration testing.
//!
//! Provides a deterministic `Marketplace` implementation that serves a
//! fixed feed, accepts purchases, and enforces bearer-token generations
//! the way the real marketplace rejects a replaced token. All state is
//! in-memory with no external dependencies.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sniper::auth::{MintedToken, RenewError, TokenManager, TokenRenewer};
use sniper::engine::events::EventSink;
use sniper::gateway::Marketplace;
use sniper::types::*;

pub const COLLECTION: &str = "plushpepe";

/// A listing in the mock collection with a fresh observation time.
pub fn make_listing(id: &str, price: Decimal, floor: Decimal) -> Listing {
    Listing {
        id: id.to_string(),
        collection_id: "col-plushpepe".to_string(),
        collection: COLLECTION.to_string(),
        model: "Gold".to_string(),
        name: format!("Plush Pepe #{id}"),
        price,
        floor_price: Some(floor),
        velocity: dec!(3),
        trending: false,
        observed_at: Utc::now(),
    }
}

/// Ask 7 against a floor of 10: comfortably above the default threshold.
pub fn profitable(id: &str) -> Listing {
    make_listing(id, dec!(7), dec!(10))
}

/// Ask 9.9 against a floor of 10: fees eat the spread.
pub fn unprofitable(id: &str) -> Listing {
    make_listing(id, dec!(9.9), dec!(10))
}

pub fn fresh_stats() -> MarketStats {
    MarketStats {
        fee_rate: dec!(0.05),
        floor_observed_at: Some(Utc::now()),
    }
}

// ---------------------------------------------------------------------------
// Marketplace
// ---------------------------------------------------------------------------

/// A mock marketplace for deterministic testing.
///
/// Requests carry the token from the attached `TokenManager`; any token
/// older than `required_generation` is answered with a 401.
pub struct MockMarketplace {
    listings: Arc<Mutex<Vec<Listing>>>,
    tokens: Option<Arc<TokenManager>>,
    required_generation: AtomicU64,
    buy_delay: Duration,
    /// If set, every purchase returns this error.
    force_error: Arc<Mutex<Option<GatewayError>>>,
    receipts: Arc<Mutex<Vec<BuyReceipt>>>,
    fetch_calls: AtomicUsize,
    buy_calls: AtomicUsize,
}

impl MockMarketplace {
    pub fn new(listings: Vec<Listing>) -> Self {
        Self {
            listings: Arc::new(Mutex::new(listings)),
            tokens: None,
            required_generation: AtomicU64::new(1),
            buy_delay: Duration::ZERO,
            force_error: Arc::new(Mutex::new(None)),
            receipts: Arc::new(Mutex::new(Vec::new())),
            fetch_calls: AtomicUsize::new(0),
            buy_calls: AtomicUsize::new(0),
        }
    }

    /// Authenticate every request with `tokens`.
    pub fn with_tokens(mut self, tokens: Arc<TokenManager>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Make every purchase take `delay` of (tokio) time.
    pub fn with_buy_delay(mut self, delay: Duration) -> Self {
        self.buy_delay = delay;
        self
    }

    /// Reject tokens older than `generation` with a 401.
    pub fn require_generation(&self, generation: u64) {
        self.required_generation.store(generation, Ordering::SeqCst);
    }

    /// Force all subsequent purchases to return an error.
    pub fn set_error(&self, err: GatewayError) {
        *self.force_error.lock().unwrap() = Some(err);
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    pub fn set_listings(&self, listings: Vec<Listing>) {
        *self.listings.lock().unwrap() = listings;
    }

    pub fn get_receipts(&self) -> Vec<BuyReceipt> {
        self.receipts.lock().unwrap().clone()
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn buy_calls(&self) -> usize {
        self.buy_calls.load(Ordering::SeqCst)
    }

    /// Generation of the token attached to an outgoing request.
    async fn presented_generation(&self) -> Result<Option<u64>, GatewayError> {
        match &self.tokens {
            Some(tokens) => Ok(Some(tokens.current().await?.generation)),
            None => Ok(None),
        }
    }

    /// Check the presented token the way the marketplace would.
    fn authorize(&self, presented: Option<u64>) -> Result<(), GatewayError> {
        match presented {
            Some(generation) if generation < self.required_generation.load(Ordering::SeqCst) => {
                Err(GatewayError::AuthExpired { generation })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Marketplace for MockMarketplace {
    async fn fetch_snapshot(&self) -> Result<FeedSnapshot, GatewayError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let presented = self.presented_generation().await?;
        self.authorize(presented)?;

        let listings = self.listings.lock().unwrap().clone();
        let mut stats = HashMap::new();
        stats.insert(COLLECTION.to_string(), fresh_stats());
        Ok(FeedSnapshot {
            listings,
            stats,
            fetched_at: Utc::now(),
        })
    }

    async fn buy(&self, listing: &Listing) -> Result<BuyReceipt, GatewayError> {
        self.buy_calls.fetch_add(1, Ordering::SeqCst);
        // The token is read at send time and judged when the request lands.
        let presented = self.presented_generation().await?;
        if !self.buy_delay.is_zero() {
            tokio::time::sleep(self.buy_delay).await;
        }
        self.authorize(presented)?;

        if let Some(err) = self.force_error.lock().unwrap().clone() {
            return Err(err);
        }

        let receipt = BuyReceipt {
            listing_id: listing.id.clone(),
            price: listing.price,
            order_id: Some(format!("order-{}", listing.id)),
            dry_run: false,
            timestamp: Utc::now(),
        };
        self.receipts.lock().unwrap().push(receipt.clone());
        Ok(receipt)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ---------------------------------------------------------------------------
// Session renewer
// ---------------------------------------------------------------------------

/// Mints `token-2`, `token-3`, ... after a delay, or fails every time.
pub struct CountingRenewer {
    delay: Duration,
    fail: bool,
    calls: AtomicUsize,
}

impl CountingRenewer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            delay: Duration::from_millis(10),
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRenewer for CountingRenewer {
    async fn renew(&self) -> Result<MintedToken, RenewError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 2;
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(RenewError::Unauthorized("session revoked".to_string()));
        }
        Ok(MintedToken {
            value: SecretString::new(format!("token-{n}")),
            expires_at: None,
        })
    }
}

/// A token manager seeded with `token-1`.
pub fn make_tokens(renewer: Arc<CountingRenewer>, events: EventSink) -> Arc<TokenManager> {
    Arc::new(TokenManager::new(
        SecretString::new("token-1".to_string()),
        None,
        renewer,
        events,
    ))
}
