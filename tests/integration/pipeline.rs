//! End-to-end pipeline tests against the mock marketplace.
//!
//! Time is paused, so backoff, renewal delays and scan intervals run
//! instantly and deterministically.

use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use sniper::auth::TokenManager;
use sniper::engine::events::{EngineEvent, EventSink};
use sniper::engine::executor::{ExecutorConfig, PurchaseExecutor};
use sniper::engine::scanner::{ScanConfig, ScanLoop, ScanReport};
use sniper::engine::shutdown::{self, Shutdown};
use sniper::strategy::{Valuator, ValuationConfig};
use sniper::types::*;

use crate::mock_marketplace::*;

// ---- helpers ---------------------------------------------------------------

fn make_executor(
    market: Arc<MockMarketplace>,
    tokens: Arc<TokenManager>,
    events: EventSink,
) -> PurchaseExecutor {
    PurchaseExecutor::new(
        market,
        tokens,
        events,
        Shutdown::never(),
        ExecutorConfig::default(),
    )
}

fn make_loop(
    market: Arc<MockMarketplace>,
    tokens: Arc<TokenManager>,
    events: EventSink,
    shutdown: Shutdown,
) -> ScanLoop {
    let executor = Arc::new(PurchaseExecutor::new(
        market.clone(),
        tokens.clone(),
        events.clone(),
        shutdown,
        ExecutorConfig::default(),
    ));
    ScanLoop::new(
        market,
        tokens,
        Arc::new(Valuator::new(ValuationConfig::default())),
        executor,
        events,
        ScanConfig {
            interval: Duration::from_millis(100),
            ..ScanConfig::default()
        },
    )
}

/// Run the loop for `duration` of paused time, then shut it down.
async fn run_for(
    market: Arc<MockMarketplace>,
    tokens: Arc<TokenManager>,
    duration: Duration,
) -> Result<ScanReport, SniperError> {
    let (trigger, shutdown) = shutdown::channel();
    let scan = make_loop(market, tokens, EventSink::disabled(), shutdown.clone());
    let stopper = async move {
        tokio::time::sleep(duration).await;
        trigger.trigger();
    };
    let (result, ()) = tokio::join!(scan.run(shutdown), stopper);
    result
}

fn accepted(listing: Listing) -> Decision {
    let valuator = Valuator::new(ValuationConfig::default());
    let decision = valuator.evaluate(Arc::new(listing), &fresh_stats());
    assert!(decision.is_accept(), "fixture should be accepted: {decision}");
    decision
}

fn drain(rx: &mut mpsc::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn token_transitions(events: &[EngineEvent]) -> Vec<(TokenState, TokenState)> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::TokenStateChanged { from, to, .. } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

// ---- purchase path -----------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_expired_token_refreshes_and_purchase_retries_once() {
    let (events, mut rx) = EventSink::channel(64);
    let renewer = Arc::new(CountingRenewer::new(Duration::from_millis(50)));
    let tokens = make_tokens(renewer.clone(), events.clone());
    let market = Arc::new(MockMarketplace::new(vec![]).with_tokens(tokens.clone()));
    market.require_generation(2);
    let executor = make_executor(market.clone(), tokens.clone(), events.clone());

    let attempt = executor.attempt_purchase(&accepted(profitable("L1"))).await;

    assert_eq!(attempt.outcome, PurchaseOutcome::Succeeded);
    assert_eq!(attempt.calls, 2);
    assert_eq!(renewer.calls(), 1);
    assert_eq!(tokens.generation(), 2);
    assert_eq!(tokens.state(), TokenState::Valid);
    assert_eq!(market.get_receipts().len(), 1);

    let seen = drain(&mut rx);
    assert_eq!(
        token_transitions(&seen),
        vec![
            (TokenState::Valid, TokenState::Refreshing),
            (TokenState::Refreshing, TokenState::Valid),
        ]
    );
    match seen.last() {
        Some(EngineEvent::PurchaseFinished(finished)) => {
            assert_eq!(finished.id, attempt.id);
            assert!(finished.succeeded());
        }
        other => panic!("expected PurchaseFinished last, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_second_rejection_after_refresh_is_auth_failure() {
    let renewer = Arc::new(CountingRenewer::new(Duration::from_millis(10)));
    let tokens = make_tokens(renewer.clone(), EventSink::disabled());
    let market = Arc::new(MockMarketplace::new(vec![]).with_tokens(tokens.clone()));
    market.require_generation(5);
    let executor = make_executor(market.clone(), tokens.clone(), EventSink::disabled());

    let attempt = executor.attempt_purchase(&accepted(profitable("L1"))).await;

    assert_eq!(attempt.outcome, PurchaseOutcome::FailedAuth);
    assert_eq!(attempt.calls, 2);
    assert_eq!(market.buy_calls(), 2);
    assert_eq!(renewer.calls(), 1);
    // The renewal itself worked; only the purchase gave up.
    assert_eq!(tokens.state(), TokenState::Valid);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_rejections_share_one_renewal() {
    let renewer = Arc::new(CountingRenewer::new(Duration::from_millis(50)));
    let tokens = make_tokens(renewer.clone(), EventSink::disabled());
    let market = Arc::new(
        MockMarketplace::new(vec![])
            .with_tokens(tokens.clone())
            .with_buy_delay(Duration::from_millis(20)),
    );
    market.require_generation(2);
    let executor = make_executor(market.clone(), tokens.clone(), EventSink::disabled());

    let decisions: Vec<Decision> = ["A", "B", "C", "D"]
        .into_iter()
        .map(|id| accepted(profitable(id)))
        .collect();
    let attempts = executor.execute_batch(&decisions).await;

    assert_eq!(attempts.len(), 4);
    assert!(attempts.iter().all(|a| a.succeeded()));
    assert!(attempts.iter().all(|a| a.calls == 2));
    assert_eq!(renewer.calls(), 1);
    assert_eq!(tokens.renewals(), 1);
    assert_eq!(tokens.generation(), 2);
    assert_eq!(market.buy_calls(), 8);
}

#[tokio::test(start_paused = true)]
async fn test_failed_renewal_invalidates_and_later_purchases_fail_fast() {
    let (events, mut rx) = EventSink::channel(64);
    let renewer = Arc::new(CountingRenewer::failing());
    let tokens = make_tokens(renewer.clone(), events.clone());
    let market = Arc::new(MockMarketplace::new(vec![]).with_tokens(tokens.clone()));
    market.require_generation(2);
    let executor = make_executor(market.clone(), tokens.clone(), events.clone());

    let first = executor.attempt_purchase(&accepted(profitable("L1"))).await;
    assert_eq!(first.outcome, PurchaseOutcome::FailedAuth);
    assert!(tokens.is_invalid());
    assert!(tokens.invalid_reason().is_some());

    let second = executor.attempt_purchase(&accepted(profitable("L2"))).await;
    assert_eq!(second.outcome, PurchaseOutcome::FailedAuth);
    assert_eq!(renewer.calls(), 1);

    assert_eq!(
        token_transitions(&drain(&mut rx)),
        vec![
            (TokenState::Valid, TokenState::Refreshing),
            (TokenState::Refreshing, TokenState::Invalid),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_accepts_buy_once() {
    let tokens = make_tokens(
        Arc::new(CountingRenewer::new(Duration::ZERO)),
        EventSink::disabled(),
    );
    let market = Arc::new(MockMarketplace::new(vec![]).with_buy_delay(Duration::from_millis(30)));
    let executor = make_executor(market.clone(), tokens, EventSink::disabled());

    let decision = accepted(profitable("L1"));
    let attempts = executor
        .execute_batch(&[decision.clone(), decision])
        .await;

    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts.iter().filter(|a| a.succeeded()).count(), 1);
    let duplicate = attempts
        .iter()
        .find(|a| !a.succeeded())
        .expect("one attempt is the duplicate");
    assert_eq!(duplicate.outcome, PurchaseOutcome::FailedMarket);
    assert_eq!(duplicate.calls, 0);
    assert_eq!(market.buy_calls(), 1);
    assert_eq!(executor.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_market_refusal_is_not_retried() {
    let tokens = make_tokens(
        Arc::new(CountingRenewer::new(Duration::ZERO)),
        EventSink::disabled(),
    );
    let market = Arc::new(MockMarketplace::new(vec![]));
    market.set_error(GatewayError::Client {
        status: 409,
        body: "already sold".to_string(),
    });
    let executor = make_executor(market.clone(), tokens, EventSink::disabled());

    let attempt = executor.attempt_purchase(&accepted(profitable("L1"))).await;

    assert_eq!(attempt.outcome, PurchaseOutcome::FailedMarket);
    assert_eq!(attempt.calls, 1);
    assert!(attempt.reason.unwrap_or_default().contains("409"));
}

#[tokio::test(start_paused = true)]
async fn test_network_failure_backs_off_then_recovers() {
    let tokens = make_tokens(
        Arc::new(CountingRenewer::new(Duration::ZERO)),
        EventSink::disabled(),
    );
    let market = Arc::new(MockMarketplace::new(vec![]));
    market.set_error(GatewayError::Network("connection reset".to_string()));
    let executor = make_executor(market.clone(), tokens, EventSink::disabled());

    let attempt = executor.attempt_purchase(&accepted(profitable("L1"))).await;
    assert_eq!(attempt.outcome, PurchaseOutcome::FailedNetwork);
    assert_eq!(attempt.calls, 1 + ExecutorConfig::default().max_network_retries);

    market.clear_error();
    let retried = executor.attempt_purchase(&accepted(profitable("L1"))).await;
    assert!(retried.succeeded());
}

// ---- scan loop ---------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_scan_loop_buys_each_listing_once_across_ticks() {
    let tokens = make_tokens(
        Arc::new(CountingRenewer::new(Duration::ZERO)),
        EventSink::disabled(),
    );
    let market = Arc::new(
        MockMarketplace::new(vec![profitable("L1"), unprofitable("L2")])
            .with_tokens(tokens.clone()),
    );

    let report = run_for(market.clone(), tokens, Duration::from_millis(450))
        .await
        .expect("loop stops cleanly");

    assert!(report.ticks >= 4, "ticks = {}", report.ticks);
    assert_eq!(market.fetch_calls() as u64, report.ticks);
    assert_eq!(report.new_listings, 2);
    assert_eq!(report.decisions, 2);
    assert_eq!(report.accepted, 1);
    assert_eq!(report.purchases_succeeded, 1);
    assert_eq!(market.buy_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scan_loop_picks_up_new_listing_mid_run() {
    let tokens = make_tokens(
        Arc::new(CountingRenewer::new(Duration::ZERO)),
        EventSink::disabled(),
    );
    let market = Arc::new(MockMarketplace::new(vec![profitable("L1")]));

    let (trigger, shutdown) = shutdown::channel();
    let scan = make_loop(market.clone(), tokens, EventSink::disabled(), shutdown.clone());
    let feed = market.clone();
    let driver = async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        feed.set_listings(vec![profitable("L1"), make_listing("L3", dec!(5), dec!(10))]);
        tokio::time::sleep(Duration::from_millis(250)).await;
        trigger.trigger();
    };
    let (result, ()) = tokio::join!(scan.run(shutdown), driver);
    let report = result.expect("loop stops cleanly");

    assert_eq!(report.new_listings, 2);
    assert_eq!(report.purchases_succeeded, 2);
    let bought: Vec<String> = market
        .get_receipts()
        .into_iter()
        .map(|r| r.listing_id)
        .collect();
    assert_eq!(bought, vec!["L1".to_string(), "L3".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_scan_loop_refreshes_on_feed_rejection() {
    let renewer = Arc::new(CountingRenewer::new(Duration::from_millis(20)));
    let tokens = make_tokens(renewer.clone(), EventSink::disabled());
    let market = Arc::new(MockMarketplace::new(vec![profitable("L1")]).with_tokens(tokens.clone()));
    market.require_generation(2);

    let report = run_for(market.clone(), tokens.clone(), Duration::from_millis(350))
        .await
        .expect("loop recovers after refresh");

    assert_eq!(renewer.calls(), 1);
    assert_eq!(tokens.generation(), 2);
    assert_eq!(report.skipped_ticks, 0);
    assert_eq!(report.purchases_succeeded, 1);
    assert_eq!(market.buy_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scan_loop_stops_with_exit_code_two_when_renewal_fails() {
    let renewer = Arc::new(CountingRenewer::failing());
    let tokens = make_tokens(renewer.clone(), EventSink::disabled());
    let market = Arc::new(MockMarketplace::new(vec![profitable("L1")]).with_tokens(tokens.clone()));
    market.require_generation(2);

    let scan = make_loop(
        market.clone(),
        tokens.clone(),
        EventSink::disabled(),
        Shutdown::never(),
    );
    let err = scan
        .run(Shutdown::never())
        .await
        .expect_err("invalid credentials end the loop");

    assert!(matches!(err, SniperError::AuthInvalid(_)));
    assert_eq!(err.exit_code(), 2);
    assert!(tokens.is_invalid());
    assert_eq!(renewer.calls(), 1);
    assert_eq!(market.buy_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_scan_loop_emits_scan_and_decision_events() {
    let (events, mut rx) = EventSink::channel(256);
    let tokens = make_tokens(
        Arc::new(CountingRenewer::new(Duration::ZERO)),
        events.clone(),
    );
    let market = Arc::new(MockMarketplace::new(vec![profitable("L1"), unprofitable("L2")]));

    let (trigger, shutdown) = shutdown::channel();
    let scan = make_loop(market, tokens, events.clone(), shutdown.clone());
    let stopper = async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.trigger();
    };
    let (result, ()) = tokio::join!(scan.run(shutdown), stopper);
    assert!(result.is_ok());

    let seen = drain(&mut rx);
    assert!(matches!(
        seen.first(),
        Some(EngineEvent::ScanCompleted { tick: 1, fetched: 2, new: 2 })
    ));
    let verdicts: Vec<(String, Verdict)> = seen
        .iter()
        .filter_map(|e| match e {
            EngineEvent::DecisionMade {
                listing_id, verdict, ..
            } => Some((listing_id.clone(), *verdict)),
            _ => None,
        })
        .collect();
    assert_eq!(
        verdicts,
        vec![
            ("L1".to_string(), Verdict::Accept),
            ("L2".to_string(), Verdict::Reject(RejectReason::BelowThreshold)),
        ]
    );
    let purchases = seen
        .iter()
        .filter(|e| matches!(e, EngineEvent::PurchaseFinished(a) if a.succeeded()))
        .count();
    assert_eq!(purchases, 1);
    assert_eq!(events.dropped(), 0);
}
