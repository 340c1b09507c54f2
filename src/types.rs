//! Shared types for the SNIPER agent.
//!
//! These types form the data model used across all modules. They are kept
//! free of behaviour that touches the network so that gateway, strategy and
//! engine modules can depend on them without circular references.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// A marketplace item currently offered for sale.
///
/// Immutable once fetched. A later fetch of the same item yields a new
/// `Listing` value; the engine shares listings as `Arc<Listing>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    /// Marketplace identifier, unique per item.
    pub id: String,
    /// Collection identifier as reported by the feed.
    pub collection_id: String,
    /// Collection slug used by the floor and statistics endpoints.
    pub collection: String,
    /// Item model (floor prices are tracked per model).
    pub model: String,
    pub name: String,
    /// Current asking price.
    pub price: Decimal,
    /// Floor price of the item's model, if the marketplace reported one.
    pub floor_price: Option<Decimal>,
    /// Recent sales in the collection over the last 24 hours.
    pub velocity: Decimal,
    pub trending: bool,
    pub observed_at: DateTime<Utc>,
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let floor = self
            .floor_price
            .map(|p| p.to_string())
            .unwrap_or_else(|| "?".to_string());
        write!(
            f,
            "[{}] {} ({}) ask={} floor={} vel={}{}",
            self.collection,
            self.name,
            self.model,
            self.price,
            floor,
            self.velocity,
            if self.trending { " trending" } else { "" },
        )
    }
}

impl Listing {
    /// Helper to build a test listing with sensible defaults.
    #[cfg(test)]
    pub fn sample(id: &str, price: Decimal, floor: Decimal) -> Self {
        Listing {
            id: id.to_string(),
            collection_id: "col-001".to_string(),
            collection: "plushpepe".to_string(),
            model: "Gold".to_string(),
            name: format!("Plush Pepe #{id}"),
            price,
            floor_price: Some(floor),
            velocity: Decimal::from(3),
            trending: false,
            observed_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Market statistics
// ---------------------------------------------------------------------------

/// Per-collection context used when valuing a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketStats {
    /// Fee charged when the item is resold, as a fraction of the sale price.
    pub fee_rate: Decimal,
    /// When the collection's floor prices were last refreshed.
    pub floor_observed_at: Option<DateTime<Utc>>,
}

impl MarketStats {
    /// Stats for a collection the feed said nothing about.
    pub fn missing() -> Self {
        Self {
            fee_rate: Decimal::ZERO,
            floor_observed_at: None,
        }
    }
}

/// One response of the listing feed.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub listings: Vec<Listing>,
    /// Keyed by collection slug.
    pub stats: HashMap<String, MarketStats>,
    pub fetched_at: DateTime<Utc>,
}

impl FeedSnapshot {
    /// Stats for one collection; unknown collections get missing stats so
    /// their listings are rejected rather than priced blind.
    pub fn stats_for(&self, collection: &str) -> MarketStats {
        self.stats
            .get(collection)
            .cloned()
            .unwrap_or_else(MarketStats::missing)
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Why a listing was not worth buying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    BelowThreshold,
    StaleFloorData,
    MissingFields,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::BelowThreshold => "below-threshold",
            RejectReason::StaleFloorData => "stale-floor-data",
            RejectReason::MissingFields => "missing-fields",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Accept,
    Reject(RejectReason),
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accept => write!(f, "ACCEPT"),
            Verdict::Reject(reason) => write!(f, "REJECT({reason})"),
        }
    }
}

/// Outcome of valuing one listing. Derived, never persisted.
#[derive(Debug, Clone)]
pub struct Decision {
    pub listing: Arc<Listing>,
    /// `floor - ask - fees` before liquidity weighting.
    pub raw_profit: Decimal,
    /// Profit estimate after liquidity weighting; compared to the threshold.
    pub profit: Decimal,
    pub multiplier: Decimal,
    pub verdict: Verdict,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} | raw={} adj={} x{}",
            self.verdict,
            self.listing.id,
            self.raw_profit.round_dp(4),
            self.profit.round_dp(4),
            self.multiplier.round_dp(3),
        )
    }
}

impl Decision {
    pub fn is_accept(&self) -> bool {
        self.verdict == Verdict::Accept
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self.verdict {
            Verdict::Accept => None,
            Verdict::Reject(reason) => Some(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Purchases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PurchaseOutcome {
    Pending,
    Succeeded,
    FailedMarket,
    FailedAuth,
    FailedNetwork,
}

impl PurchaseOutcome {
    pub fn code(&self) -> &'static str {
        match self {
            PurchaseOutcome::Pending => "pending",
            PurchaseOutcome::Succeeded => "succeeded",
            PurchaseOutcome::FailedMarket => "failed-market",
            PurchaseOutcome::FailedAuth => "failed-auth",
            PurchaseOutcome::FailedNetwork => "failed-network",
        }
    }

    pub fn is_final(&self) -> bool {
        *self != PurchaseOutcome::Pending
    }
}

impl fmt::Display for PurchaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Receipt returned by the marketplace after a successful buy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyReceipt {
    pub listing_id: String,
    pub price: Decimal,
    pub order_id: Option<String>,
    pub dry_run: bool,
    pub timestamp: DateTime<Utc>,
}

impl BuyReceipt {
    /// Receipt for a buy that was only logged.
    pub fn dry_run(listing: &Listing) -> Self {
        Self {
            listing_id: listing.id.clone(),
            price: listing.price,
            order_id: None,
            dry_run: true,
            timestamp: Utc::now(),
        }
    }
}

/// One buy attempt for one listing, from dispatch to final outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseAttempt {
    pub id: Uuid,
    pub listing_id: String,
    pub attempted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Buy calls actually sent to the marketplace.
    pub calls: u32,
    pub outcome: PurchaseOutcome,
    pub reason: Option<String>,
    pub receipt: Option<BuyReceipt>,
}

impl fmt::Display for PurchaseAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} calls={}", self.outcome, self.listing_id, self.calls)?;
        if let Some(reason) = &self.reason {
            write!(f, " ({reason})")?;
        }
        Ok(())
    }
}

impl PurchaseAttempt {
    pub fn new(listing_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            listing_id: listing_id.to_string(),
            attempted_at: Utc::now(),
            finished_at: None,
            calls: 0,
            outcome: PurchaseOutcome::Pending,
            reason: None,
            receipt: None,
        }
    }

    /// Record the final outcome. The first call wins; an attempt is never
    /// finalised twice.
    pub fn finish(&mut self, outcome: PurchaseOutcome, reason: Option<String>) {
        if self.outcome.is_final() {
            return;
        }
        self.outcome = outcome;
        self.reason = reason;
        self.finished_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == PurchaseOutcome::Succeeded
    }
}

// ---------------------------------------------------------------------------
// Token state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenState {
    Valid,
    Refreshing,
    Invalid,
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenState::Valid => write!(f, "valid"),
            TokenState::Refreshing => write!(f, "refreshing"),
            TokenState::Invalid => write!(f, "invalid"),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// The token manager can no longer produce a usable credential.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("authentication invalid: {0}")]
    Invalid(String),
}

/// Classified failure of a marketplace call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// 401. Carries the generation of the token the request was sent with.
    #[error("auth expired (token generation {generation})")]
    AuthExpired { generation: u64 },

    #[error("auth invalid: {0}")]
    AuthInvalid(String),

    /// 429 or 5xx.
    #[error("rate limited (HTTP {status}), retry after {retry_after:?}")]
    RateLimited { status: u16, retry_after: Duration },

    /// Any other 4xx: the marketplace refused the request on its merits.
    #[error("client error HTTP {status}: {body}")]
    Client { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Invalid(reason) => GatewayError::AuthInvalid(reason),
        }
    }
}

/// Errors that end the scan loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SniperError {
    #[error("authentication invalid, manual re-authorization required: {0}")]
    AuthInvalid(String),

    #[error("work queue closed while the scan loop was running")]
    QueueClosed,
}

impl SniperError {
    /// Process exit code the supervisor sees for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            SniperError::AuthInvalid(_) => 2,
            SniperError::QueueClosed => 1,
        }
    }
}

impl From<AuthError> for SniperError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Invalid(reason) => SniperError::AuthInvalid(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
