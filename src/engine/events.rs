//! Observability events.
//!
//! The engine reports what it does as `EngineEvent` values on a bounded
//! channel. Emitting never blocks: when the channel is full the event is
//! dropped and counted, so a slow consumer can never stall a scan or a
//! purchase.

use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::types::{PurchaseAttempt, PurchaseOutcome, TokenState, Verdict};

#[derive(Debug, Clone)]
pub enum EngineEvent {
    ScanCompleted {
        tick: u64,
        fetched: usize,
        new: usize,
    },
    /// A tick produced nothing usable (fetch failed or skipped).
    ScanSkipped {
        tick: u64,
        reason: String,
    },
    DecisionMade {
        listing_id: String,
        collection: String,
        price: Decimal,
        profit: Decimal,
        verdict: Verdict,
    },
    PurchaseFinished(PurchaseAttempt),
    TokenStateChanged {
        from: TokenState,
        to: TokenState,
        generation: u64,
    },
}

/// Cloneable, non-blocking handle for emitting events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<EngineEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    /// Create a sink and the receiving end the observer drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, rx)
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, event: EngineEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(dropped, "Event channel full, dropping event");
            }
            // Observer went away; nothing left to report to.
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Events dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drain events into `tracing` until every sink is dropped.
pub async fn log_events(mut rx: mpsc::Receiver<EngineEvent>) {
    while let Some(event) = rx.recv().await {
        log_event(&event);
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::ScanCompleted { tick, fetched, new } => {
            if *new > 0 {
                info!(tick, fetched, new, "Scan found new listings");
            } else {
                debug!(tick, fetched, "Scan completed, nothing new");
            }
        }
        EngineEvent::ScanSkipped { tick, reason } => {
            debug!(tick, reason = %reason, "Scan skipped");
        }
        EngineEvent::DecisionMade {
            listing_id,
            collection,
            price,
            profit,
            verdict,
        } => match verdict {
            Verdict::Accept => info!(
                listing_id = %listing_id,
                collection = %collection,
                price = %price,
                profit = %profit.round_dp(4),
                "Profitable listing"
            ),
            Verdict::Reject(reason) => debug!(
                listing_id = %listing_id,
                collection = %collection,
                price = %price,
                profit = %profit.round_dp(4),
                reason = %reason,
                "Listing rejected"
            ),
        },
        EngineEvent::PurchaseFinished(attempt) => match attempt.outcome {
            PurchaseOutcome::Succeeded => info!(
                attempt_id = %attempt.id,
                listing_id = %attempt.listing_id,
                calls = attempt.calls,
                dry_run = attempt.receipt.as_ref().map(|r| r.dry_run).unwrap_or(false),
                "Purchase succeeded"
            ),
            outcome => warn!(
                attempt_id = %attempt.id,
                listing_id = %attempt.listing_id,
                calls = attempt.calls,
                outcome = %outcome,
                reason = attempt.reason.as_deref().unwrap_or(""),
                "Purchase failed"
            ),
        },
        EngineEvent::TokenStateChanged {
            from,
            to,
            generation,
        } => {
            info!(from = %from, to = %to, generation, "Token state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_event(tick: u64) -> EngineEvent {
        EngineEvent::ScanCompleted {
            tick,
            fetched: 3,
            new: 1,
        }
    }

    #[tokio::test]
    async fn test_emit_delivers_in_order() {
        let (sink, mut rx) = EventSink::channel(8);
        sink.emit(scan_event(1));
        sink.emit(scan_event(2));

        match rx.recv().await {
            Some(EngineEvent::ScanCompleted { tick, .. }) => assert_eq!(tick, 1),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await {
            Some(EngineEvent::ScanCompleted { tick, .. }) => assert_eq!(tick, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_full_channel_drops_and_counts() {
        let (sink, mut rx) = EventSink::channel(2);
        for tick in 0..5 {
            sink.emit(scan_event(tick));
        }
        assert_eq!(sink.dropped(), 3);

        // Clones share the counter
        let clone = sink.clone();
        clone.emit(scan_event(9));
        assert_eq!(sink.dropped(), 4);

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn test_closed_channel_is_silent() {
        let (sink, rx) = EventSink::channel(1);
        drop(rx);
        sink.emit(scan_event(1));
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn test_disabled_sink() {
        let sink = EventSink::disabled();
        sink.emit(scan_event(1));
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn test_log_events_ends_when_sinks_dropped() {
        let (sink, rx) = EventSink::channel(4);
        sink.emit(scan_event(1));
        sink.emit(EngineEvent::TokenStateChanged {
            from: TokenState::Valid,
            to: TokenState::Refreshing,
            generation: 1,
        });
        drop(sink);
        log_events(rx).await;
    }
}
