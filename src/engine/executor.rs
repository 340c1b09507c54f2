//! Purchase executor.
//!
//! Turns accepted decisions into buy calls. At most one attempt per listing
//! is in flight at a time: a second accept for an id that is already being
//! bought is dropped without touching the network.
//!
//! Per attempt:
//! - 401 → refresh the token (single-flight) and retry exactly once;
//! - other 4xx → `failed-market`, never retried;
//! - network / 429 / 5xx → bounded exponential backoff, then `failed-network`.

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::TokenManager;
use crate::engine::events::{EngineEvent, EventSink};
use crate::engine::shutdown::Shutdown;
use crate::gateway::Marketplace;
use crate::types::{BuyReceipt, Decision, GatewayError, Listing, PurchaseAttempt, PurchaseOutcome};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Retries after a network or rate-limit failure.
    pub max_network_retries: u32,
    /// First backoff delay; doubles on each retry.
    pub retry_base_delay: Duration,
    /// Cap on purchases dispatched from one tick.
    pub max_buys_per_tick: usize,
    /// Log buys instead of sending them.
    pub dry_run: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_network_retries: 2,
            retry_base_delay: Duration::from_millis(200),
            max_buys_per_tick: 5,
            dry_run: false,
        }
    }
}

/// Backoff before retry number `retry` (0-based).
pub fn backoff_delay(base: Duration, retry: u32) -> Duration {
    base.saturating_mul(1u32 << retry.min(16))
}

// ---------------------------------------------------------------------------
// In-flight tracking
// ---------------------------------------------------------------------------

type InFlight = Arc<Mutex<HashSet<String>>>;

fn lock(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Holds a listing id in the in-flight set until dropped.
struct InFlightClaim {
    id: String,
    set: InFlight,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct PurchaseExecutor {
    market: Arc<dyn Marketplace>,
    tokens: Arc<TokenManager>,
    events: EventSink,
    shutdown: Shutdown,
    config: ExecutorConfig,
    in_flight: InFlight,
}

/// Final result of the dispatch loop.
struct Dispatched {
    outcome: PurchaseOutcome,
    reason: Option<String>,
    receipt: Option<BuyReceipt>,
}

impl Dispatched {
    fn failed(outcome: PurchaseOutcome, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            reason: Some(reason.into()),
            receipt: None,
        }
    }
}

impl PurchaseExecutor {
    pub fn new(
        market: Arc<dyn Marketplace>,
        tokens: Arc<TokenManager>,
        events: EventSink,
        shutdown: Shutdown,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            market,
            tokens,
            events,
            shutdown,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    fn claim(&self, id: &str) -> Option<InFlightClaim> {
        let mut set = lock(&self.in_flight);
        if !set.insert(id.to_string()) {
            return None;
        }
        Some(InFlightClaim {
            id: id.to_string(),
            set: self.in_flight.clone(),
        })
    }

    /// Try to buy the listing behind one decision.
    pub async fn attempt_purchase(&self, decision: &Decision) -> PurchaseAttempt {
        let listing = &decision.listing;
        let mut attempt = PurchaseAttempt::new(&listing.id);

        if let Some(reason) = decision.reject_reason() {
            attempt.finish(
                PurchaseOutcome::FailedMarket,
                Some(format!("decision rejected: {reason}")),
            );
            return self.report(attempt);
        }

        let Some(_claim) = self.claim(&listing.id) else {
            debug!(listing_id = %listing.id, "Purchase already in flight, dropping duplicate");
            attempt.finish(
                PurchaseOutcome::FailedMarket,
                Some("purchase already in flight".to_string()),
            );
            return self.report(attempt);
        };

        if self.config.dry_run {
            info!(
                listing_id = %listing.id,
                collection = %listing.collection,
                price = %listing.price,
                profit = %decision.profit.round_dp(4),
                "[DRY RUN] Would buy listing"
            );
            attempt.receipt = Some(BuyReceipt::dry_run(listing));
            attempt.finish(PurchaseOutcome::Succeeded, None);
            return self.report(attempt);
        }

        info!(
            listing_id = %listing.id,
            price = %listing.price,
            profit = %decision.profit.round_dp(4),
            attempt_id = %attempt.id,
            "Dispatching purchase"
        );
        let result = self.dispatch(listing, &mut attempt.calls).await;
        attempt.receipt = result.receipt;
        attempt.finish(result.outcome, result.reason);
        self.report(attempt)
    }

    async fn dispatch(&self, listing: &Listing, calls: &mut u32) -> Dispatched {
        let mut auth_retried = false;
        let mut network_retries = 0u32;

        loop {
            *calls += 1;
            let err = match self.market.buy(listing).await {
                Ok(receipt) => {
                    return Dispatched {
                        outcome: PurchaseOutcome::Succeeded,
                        reason: None,
                        receipt: Some(receipt),
                    }
                }
                Err(err) => err,
            };

            match err {
                GatewayError::AuthExpired { generation } => {
                    if auth_retried {
                        return Dispatched::failed(
                            PurchaseOutcome::FailedAuth,
                            "rejected again after token refresh",
                        );
                    }
                    if let Err(e) = self.tokens.refresh(generation).await {
                        return Dispatched::failed(PurchaseOutcome::FailedAuth, e.to_string());
                    }
                    auth_retried = true;
                    debug!(listing_id = %listing.id, "Token refreshed, retrying purchase");
                }
                GatewayError::AuthInvalid(reason) => {
                    return Dispatched::failed(PurchaseOutcome::FailedAuth, reason);
                }
                GatewayError::Client { status, body } => {
                    return Dispatched::failed(
                        PurchaseOutcome::FailedMarket,
                        format!("marketplace refused (HTTP {status}): {body}"),
                    );
                }
                GatewayError::Malformed(reason) => {
                    return Dispatched::failed(PurchaseOutcome::FailedMarket, reason);
                }
                transient @ (GatewayError::Network(_) | GatewayError::RateLimited { .. }) => {
                    if network_retries >= self.config.max_network_retries {
                        return Dispatched::failed(
                            PurchaseOutcome::FailedNetwork,
                            format!("{transient} (after {network_retries} retries)"),
                        );
                    }
                    let mut delay = backoff_delay(self.config.retry_base_delay, network_retries);
                    if let GatewayError::RateLimited { retry_after, .. } = &transient {
                        delay = delay.max(*retry_after);
                    }
                    network_retries += 1;
                    warn!(
                        listing_id = %listing.id,
                        error = %transient,
                        retry = network_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Purchase failed transiently, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }

            if self.shutdown.is_triggered() {
                return Dispatched::failed(
                    PurchaseOutcome::FailedNetwork,
                    "shutdown requested before retry",
                );
            }
        }
    }

    fn report(&self, attempt: PurchaseAttempt) -> PurchaseAttempt {
        self.events.emit(EngineEvent::PurchaseFinished(attempt.clone()));
        attempt
    }

    /// Dispatch the accepted decisions of one tick concurrently, best
    /// profit first, capped at `max_buys_per_tick`.
    pub async fn execute_batch(&self, decisions: &[Decision]) -> Vec<PurchaseAttempt> {
        let mut accepted: Vec<&Decision> = decisions.iter().filter(|d| d.is_accept()).collect();
        if accepted.is_empty() {
            return Vec::new();
        }
        accepted.sort_by(|a, b| b.profit.cmp(&a.profit));
        if accepted.len() > self.config.max_buys_per_tick {
            debug!(
                accepted = accepted.len(),
                cap = self.config.max_buys_per_tick,
                "Capping purchases for this tick"
            );
            accepted.truncate(self.config.max_buys_per_tick);
        }

        info!(count = accepted.len(), dry_run = self.config.dry_run, "Executing purchase batch");
        let attempts = join_all(accepted.into_iter().map(|d| self.attempt_purchase(d))).await;

        let succeeded = attempts.iter().filter(|a| a.succeeded()).count();
        info!(
            succeeded,
            failed = attempts.len() - succeeded,
            "Purchase batch complete"
        );
        attempts
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
