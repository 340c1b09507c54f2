//! SNIPER: marketplace listing sniper.
//!
//! Entry point. Loads configuration and secrets, initialises structured
//! logging, wires the token manager, gateway, valuator and executor
//! together, and runs the scan loop until SIGINT/SIGTERM.
//!
//! Exit codes: 0 graceful stop, 1 startup/configuration error,
//! 2 credentials invalid (manual re-authorization required).

use anyhow::{Context, Result};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use sniper::auth::session::HttpSessionRenewer;
use sniper::auth::{expiry_after, TokenManager};
use sniper::config::AppConfig;
use sniper::engine::events::{log_events, EventSink};
use sniper::engine::executor::PurchaseExecutor;
use sniper::engine::scanner::{ScanLoop, ScanReport};
use sniper::engine::shutdown::{self, ShutdownTrigger};
use sniper::gateway::portal::PortalClient;
use sniper::gateway::Gateway;
use sniper::strategy::Valuator;

const BANNER: &str = r#"
 ____  _   _ ___ ____  _____ ____
/ ___|| \ | |_ _|  _ \| ____|  _ \
\___ \|  \| || || |_) |  _| | |_) |
 ___) | |\  || ||  __/| |___|  _ <
|____/|_| \_|___|_|   |_____|_| \_\

  Marketplace listing sniper v0.1.0
"#;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Upper bound on waiting for the event logger at exit.
const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    init_logging();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!(error = format!("{e:#}"), "Startup failed");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<ExitCode> {
    let config_path =
        std::env::var("SNIPER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut cfg = AppConfig::load(&config_path)?;
    cfg.apply_env_overrides();
    cfg.validate().context("Invalid configuration")?;
    let secrets = cfg.resolve_secrets()?;

    println!("{BANNER}");
    info!(
        collections = cfg.collections.len(),
        scan_interval_ms = cfg.scan.interval_ms,
        min_profit = cfg.trading.min_profit,
        liquidity = ?cfg.trading.liquidity.kind,
        dry_run = cfg.trading.dry_run,
        "SNIPER starting up"
    );

    // -- Observability ---------------------------------------------------

    let (events, event_rx) = EventSink::channel(cfg.scan.event_capacity);
    let event_log = tokio::spawn(log_events(event_rx));

    // -- Auth ------------------------------------------------------------

    let renewer = HttpSessionRenewer::new(
        cfg.auth.renew_url.clone(),
        secrets.api_id,
        secrets.api_hash,
        cfg.auth.session_name.clone(),
        Duration::from_millis(cfg.auth.renew_timeout_ms),
    )
    .context("Failed to create session renewer")?;
    let seed_expiry = cfg
        .auth
        .token_ttl_secs
        .and_then(|secs| expiry_after(chrono::Utc::now(), secs));
    let tokens = Arc::new(TokenManager::new(
        secrets.token,
        seed_expiry,
        Arc::new(renewer),
        events.clone(),
    ));

    // -- Marketplace -----------------------------------------------------

    let gateway = Arc::new(
        Gateway::new(&cfg.gateway_settings(), tokens.clone())
            .context("Failed to create HTTP gateway")?,
    );
    let market = Arc::new(PortalClient::new(
        gateway,
        cfg.collections.clone(),
        cfg.portal_settings()?,
    ));

    // -- Engine ----------------------------------------------------------

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(forward_signals(trigger));

    let valuator = Arc::new(Valuator::new(cfg.valuation_config()?));
    let executor = Arc::new(PurchaseExecutor::new(
        market.clone(),
        tokens.clone(),
        events.clone(),
        shutdown.clone(),
        cfg.executor_config(),
    ));
    let scan = ScanLoop::new(
        market,
        tokens,
        valuator,
        executor,
        events.clone(),
        cfg.scan_config(),
    );

    info!("Entering scan loop. Press Ctrl+C to stop.");
    let outcome = scan.run(shutdown).await;

    let dropped = events.dropped();
    // Close the channel so the logger drains and exits.
    drop(events);
    let _ = tokio::time::timeout(EVENT_DRAIN_TIMEOUT, event_log).await;

    match outcome {
        Ok(report) => {
            log_report(&report, dropped);
            info!("SNIPER shut down cleanly.");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!(error = %e, "SNIPER stopping: re-authorize the session and restart");
            Ok(ExitCode::from(e.exit_code()))
        }
    }
}

/// Trigger shutdown on SIGINT or SIGTERM.
async fn forward_signals(trigger: ShutdownTrigger) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received.");
    trigger.trigger();
}

/// Log a human-readable run summary.
fn log_report(report: &ScanReport, dropped_events: u64) {
    info!(
        ticks = report.ticks,
        skipped = report.skipped_ticks,
        fetched = report.listings_fetched,
        new = report.new_listings,
        decisions = report.decisions,
        accepted = report.accepted,
        bought = report.purchases_succeeded,
        failed = report.purchases_failed,
        dropped_events,
        "Run complete"
    );
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sniper=info"));

    let json_logging = std::env::var("SNIPER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
