//! Scan loop.
//!
//! A timer-driven producer fetches the listing feed once per tick, drops
//! listings it has already seen and hands the rest to a bounded queue. A
//! single consumer values each batch and dispatches purchases.
//!
//! ```text
//!   interval ─▶ fetch ─▶ ScanCache ─▶ [queue] ─▶ Valuator ─▶ PurchaseExecutor
//! ```
//!
//! Ticks never overlap: the producer is one sequential loop. When a tick
//! overruns the interval the next one starts immediately, without a burst
//! of catch-up ticks. A full queue back-pressures the producer.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::auth::TokenManager;
use crate::engine::cache::ScanCache;
use crate::engine::events::{EngineEvent, EventSink};
use crate::engine::executor::PurchaseExecutor;
use crate::engine::shutdown::Shutdown;
use crate::gateway::Marketplace;
use crate::strategy::Valuator;
use crate::types::{Decision, FeedSnapshot, GatewayError, SniperError};

// ---------------------------------------------------------------------------
// Configuration and report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub interval: Duration,
    pub cache_capacity: usize,
    pub queue_capacity: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(400),
            cache_capacity: 1000,
            queue_capacity: 4,
        }
    }
}

/// Totals for one run of the loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub ticks: u64,
    /// Ticks whose fetch failed and were skipped.
    pub skipped_ticks: u64,
    pub listings_fetched: usize,
    pub new_listings: usize,
    pub decisions: usize,
    pub accepted: usize,
    pub purchases_succeeded: usize,
    pub purchases_failed: usize,
}

impl ScanReport {
    fn absorb(&mut self, consumer: ScanReport) {
        self.decisions += consumer.decisions;
        self.accepted += consumer.accepted;
        self.purchases_succeeded += consumer.purchases_succeeded;
        self.purchases_failed += consumer.purchases_failed;
    }
}

/// One tick's snapshot, cut down to the listings not seen before.
struct ScanBatch {
    tick: u64,
    snapshot: FeedSnapshot,
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

pub struct ScanLoop {
    market: Arc<dyn Marketplace>,
    tokens: Arc<TokenManager>,
    valuator: Arc<Valuator>,
    executor: Arc<PurchaseExecutor>,
    events: EventSink,
    config: ScanConfig,
}

impl ScanLoop {
    pub fn new(
        market: Arc<dyn Marketplace>,
        tokens: Arc<TokenManager>,
        valuator: Arc<Valuator>,
        executor: Arc<PurchaseExecutor>,
        events: EventSink,
        config: ScanConfig,
    ) -> Self {
        Self {
            market,
            tokens,
            valuator,
            executor,
            events,
            config,
        }
    }

    /// Run until `shutdown` fires or credentials become invalid.
    ///
    /// On shutdown the current tick completes, queued batches are drained
    /// and in-flight purchases finish before this returns.
    pub async fn run(self, shutdown: Shutdown) -> Result<ScanReport, SniperError> {
        let ScanLoop {
            market,
            tokens,
            valuator,
            executor,
            events,
            config,
        } = self;

        info!(
            marketplace = market.name(),
            interval_ms = config.interval.as_millis() as u64,
            queue = config.queue_capacity,
            liquidity = valuator.config().liquidity.name(),
            min_profit = %valuator.config().min_profit,
            dry_run = executor.config().dry_run,
            "Scan loop starting"
        );

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let mut producer = Producer {
            market,
            tokens,
            events: events.clone(),
            cache: ScanCache::new(config.cache_capacity),
            interval: config.interval,
        };

        let mut report = ScanReport::default();
        let (produced, consumed) = tokio::join!(
            producer.run(tx, shutdown, &mut report),
            consume(rx, &valuator, &executor, &events),
        );
        report.absorb(consumed);

        match produced {
            Ok(()) => {
                info!(ticks = report.ticks, "Scan loop stopped");
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, ticks = report.ticks, "Scan loop terminated");
                Err(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

struct Producer {
    market: Arc<dyn Marketplace>,
    tokens: Arc<TokenManager>,
    events: EventSink,
    cache: ScanCache,
    interval: Duration,
}

impl Producer {
    /// Owns the sender; dropping it on return lets the consumer drain and stop.
    async fn run(
        &mut self,
        tx: mpsc::Sender<ScanBatch>,
        mut shutdown: Shutdown,
        report: &mut ScanReport,
    ) -> Result<(), SniperError> {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => {
                    info!("Shutdown requested, no further scans");
                    return Ok(());
                }
                _ = interval.tick() => {}
            }
            self.tick(&tx, report).await?;
        }
    }

    async fn tick(
        &mut self,
        tx: &mpsc::Sender<ScanBatch>,
        report: &mut ScanReport,
    ) -> Result<(), SniperError> {
        if let Some(reason) = self.tokens.invalid_reason() {
            return Err(SniperError::AuthInvalid(reason));
        }

        report.ticks += 1;
        let tick = report.ticks;

        let snapshot = match self.fetch().await {
            Ok(snapshot) => snapshot,
            Err(GatewayError::AuthInvalid(reason)) => return Err(SniperError::AuthInvalid(reason)),
            Err(e) => {
                report.skipped_ticks += 1;
                warn!(tick, error = %e, "Listing fetch failed, skipping tick");
                self.events.emit(EngineEvent::ScanSkipped {
                    tick,
                    reason: e.to_string(),
                });
                return Ok(());
            }
        };

        let FeedSnapshot {
            listings,
            stats,
            fetched_at,
        } = snapshot;
        let fetched = listings.len();
        report.listings_fetched += fetched;

        let (fresh, seen) = self.cache.partition(listings);
        report.new_listings += fresh.len();
        self.events.emit(EngineEvent::ScanCompleted {
            tick,
            fetched,
            new: fresh.len(),
        });

        if fresh.is_empty() {
            return Ok(());
        }
        debug!(tick, new = fresh.len(), seen, cached = self.cache.len(), "Queueing new listings");

        tx.send(ScanBatch {
            tick,
            snapshot: FeedSnapshot {
                listings: fresh,
                stats,
                fetched_at,
            },
        })
        .await
        .map_err(|_| SniperError::QueueClosed)
    }

    /// Fetch the feed; on a 401, refresh once and re-fetch.
    async fn fetch(&self) -> Result<FeedSnapshot, GatewayError> {
        match self.market.fetch_snapshot().await {
            Err(GatewayError::AuthExpired { generation }) => {
                warn!(generation, "Listing fetch unauthorized, refreshing token");
                self.tokens.refresh(generation).await?;
                self.market.fetch_snapshot().await
            }
            other => other,
        }
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

async fn consume(
    mut rx: mpsc::Receiver<ScanBatch>,
    valuator: &Valuator,
    executor: &PurchaseExecutor,
    events: &EventSink,
) -> ScanReport {
    let mut report = ScanReport::default();

    while let Some(ScanBatch { tick, mut snapshot }) = rx.recv().await {
        let listings = std::mem::take(&mut snapshot.listings);
        let decisions: Vec<Decision> = listings
            .into_iter()
            .map(|listing| {
                let stats = snapshot.stats_for(&listing.collection);
                let decision = valuator.evaluate(Arc::new(listing), &stats);
                events.emit(EngineEvent::DecisionMade {
                    listing_id: decision.listing.id.clone(),
                    collection: decision.listing.collection.clone(),
                    price: decision.listing.price,
                    profit: decision.profit,
                    verdict: decision.verdict,
                });
                decision
            })
            .collect();

        let accepted = decisions.iter().filter(|d| d.is_accept()).count();
        report.decisions += decisions.len();
        report.accepted += accepted;
        if accepted == 0 {
            continue;
        }

        debug!(tick, accepted, "Dispatching accepted listings");
        for attempt in executor.execute_batch(&decisions).await {
            if attempt.succeeded() {
                report.purchases_succeeded += 1;
            } else {
                report.purchases_failed += 1;
            }
        }
    }

    report
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
