//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (marketplace token, session credentials) are referenced by
//! env-var name in the config and resolved at runtime, after `.env` has
//! been loaded.

use anyhow::{bail, Context, Result};
use rust_decimal::prelude::*;
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::engine::executor::ExecutorConfig;
use crate::engine::scanner::ScanConfig;
use crate::gateway::portal::PortalSettings;
use crate::gateway::GatewaySettings;
use crate::strategy::liquidity::{LinearCurve, LiquidityWeighting};
use crate::strategy::ValuationConfig;

/// Floors older than a day are never worth pricing against.
pub const MAX_FLOOR_AGE_SECS: u64 = 86_400;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub scan: ScanSection,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub collections: Vec<CollectionConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScanSection {
    pub interval_ms: u64,
    /// Listing ids remembered before the oldest are evicted.
    pub cache_capacity: usize,
    /// Fetched batches waiting for the evaluator.
    pub queue_capacity: usize,
    /// Newest listings requested per fetch.
    pub top_n: u32,
    pub event_capacity: usize,
}

impl Default for ScanSection {
    fn default() -> Self {
        Self {
            interval_ms: 400,
            cache_capacity: 1000,
            queue_capacity: 4,
            top_n: 3,
            event_capacity: 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TradingConfig {
    pub min_profit: f64,
    /// Resale fee as a fraction of the sale price.
    pub market_fee: f64,
    pub max_floor_age_secs: u64,
    pub max_buys_per_tick: usize,
    pub dry_run: bool,
    pub liquidity: LiquidityConfig,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            min_profit: 0.3,
            market_fee: 0.05,
            max_floor_age_secs: 120,
            max_buys_per_tick: 5,
            dry_run: false,
            liquidity: LiquidityConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LiquidityKind {
    Flat,
    Linear,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LiquidityConfig {
    pub kind: LiquidityKind,
    pub velocity_pivot: f64,
    pub per_sale: f64,
    pub trending_bonus: f64,
    pub min_multiplier: f64,
    pub max_multiplier: f64,
    /// Models with fewer sales per 24h are discounted to
    /// `low_velocity_multiplier`. Unset disables the check.
    pub min_velocity: Option<f64>,
    pub low_velocity_multiplier: f64,
}

impl Default for LiquidityConfig {
    fn default() -> Self {
        Self {
            kind: LiquidityKind::Flat,
            velocity_pivot: 3.0,
            per_sale: 0.02,
            trending_bonus: 0.10,
            min_multiplier: 1.0,
            max_multiplier: 1.5,
            min_velocity: None,
            low_velocity_multiplier: 0.5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub pool_size: usize,
    pub request_timeout_ms: u64,
    /// Cooldown after a 429/5xx that carried no `Retry-After`.
    pub default_cooldown_ms: u64,
    pub max_network_retries: u32,
    pub retry_base_delay_ms: u64,
    pub floor_cache_ttl_secs: u64,
    pub stats_cache_ttl_secs: u64,
    /// Sales ratio (last 24h over the 24h before) that counts as trending.
    pub trending_threshold: f64,
    pub user_agent: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://portal-market.com/api".to_string(),
            pool_size: 4,
            request_timeout_ms: 10_000,
            default_cooldown_ms: 1_000,
            max_network_retries: 2,
            retry_base_delay_ms: 200,
            floor_cache_ttl_secs: 30,
            stats_cache_ttl_secs: 60,
            trending_threshold: 1.5,
            user_agent: "SNIPER/0.1.0".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub token_env: String,
    pub api_id_env: String,
    pub api_hash_env: String,
    pub session_name: String,
    /// Session sidecar endpoint that mints marketplace tokens.
    pub renew_url: String,
    pub renew_timeout_ms: u64,
    /// Best-effort lifetime of the seed token; unknown if unset.
    pub token_ttl_secs: Option<u64>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_env: "APORTALS_AUTH".to_string(),
            api_id_env: "API_ID".to_string(),
            api_hash_env: "API_HASH".to_string(),
            session_name: "account".to_string(),
            renew_url: "http://127.0.0.1:8765/renew".to_string(),
            renew_timeout_ms: 30_000,
            token_ttl_secs: None,
        }
    }
}

/// A collection to watch.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CollectionConfig {
    pub name: String,
    pub id: String,
    pub short_name: String,
    #[serde(default)]
    pub models: Vec<String>,
}

/// Secrets resolved from the environment.
pub struct Secrets {
    pub token: SecretString,
    pub api_id: SecretString,
    pub api_hash: SecretString,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// `DRY_RUN` in the environment overrides `trading.dry_run`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("DRY_RUN") {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.trading.dry_run = true,
                "0" | "false" | "no" => self.trading.dry_run = false,
                _ => {}
            }
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scan.interval_ms == 0 {
            bail!("scan.interval_ms must be positive");
        }
        if self.scan.cache_capacity == 0 {
            bail!("scan.cache_capacity must be positive");
        }
        if self.scan.queue_capacity == 0 {
            bail!("scan.queue_capacity must be positive");
        }
        if self.scan.top_n == 0 {
            bail!("scan.top_n must be positive");
        }
        if self.gateway.pool_size == 0 {
            bail!("gateway.pool_size must be positive");
        }
        if self.gateway.request_timeout_ms == 0 {
            bail!("gateway.request_timeout_ms must be positive");
        }
        if !self.trading.min_profit.is_finite() || self.trading.min_profit < 0.0 {
            bail!("trading.min_profit must be a non-negative number");
        }
        if !(0.0..1.0).contains(&self.trading.market_fee) {
            bail!("trading.market_fee must be in [0, 1)");
        }
        if self.trading.max_floor_age_secs > MAX_FLOOR_AGE_SECS {
            bail!("trading.max_floor_age_secs must be at most {MAX_FLOOR_AGE_SECS}");
        }
        if self.trading.max_buys_per_tick == 0 {
            bail!("trading.max_buys_per_tick must be positive");
        }
        let liq = &self.trading.liquidity;
        if liq.min_multiplier <= 0.0 || liq.min_multiplier > liq.max_multiplier {
            bail!("trading.liquidity requires 0 < min_multiplier <= max_multiplier");
        }
        if !(0.0..=liq.min_multiplier).contains(&liq.low_velocity_multiplier) {
            bail!("trading.liquidity requires 0 <= low_velocity_multiplier <= min_multiplier");
        }
        if liq.min_velocity.is_some_and(|v| !v.is_finite() || v < 0.0) {
            bail!("trading.liquidity.min_velocity must be a non-negative number");
        }
        if liq.per_sale < 0.0 || liq.trending_bonus < 0.0 {
            bail!("trading.liquidity per_sale and trending_bonus must be non-negative");
        }
        if self.collections.is_empty() {
            bail!("at least one [[collections]] entry is required");
        }
        for c in &self.collections {
            if c.short_name.trim().is_empty() || c.id.trim().is_empty() {
                bail!("collection '{}' needs both id and short_name", c.name);
            }
        }
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        let value = std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))?;
        if value.trim().is_empty() {
            bail!("Environment variable is empty: {env_name}");
        }
        Ok(value)
    }

    pub fn resolve_secrets(&self) -> Result<Secrets> {
        Ok(Secrets {
            token: SecretString::new(Self::resolve_env(&self.auth.token_env)?),
            api_id: SecretString::new(Self::resolve_env(&self.auth.api_id_env)?),
            api_hash: SecretString::new(Self::resolve_env(&self.auth.api_hash_env)?),
        })
    }

    // -- Component settings ---------------------------------------------

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            interval: Duration::from_millis(self.scan.interval_ms),
            cache_capacity: self.scan.cache_capacity,
            queue_capacity: self.scan.queue_capacity,
        }
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            base_url: self.gateway.base_url.clone(),
            pool_size: self.gateway.pool_size,
            request_timeout: Duration::from_millis(self.gateway.request_timeout_ms),
            default_cooldown: Duration::from_millis(self.gateway.default_cooldown_ms),
            user_agent: self.gateway.user_agent.clone(),
        }
    }

    pub fn portal_settings(&self) -> Result<PortalSettings> {
        Ok(PortalSettings {
            top_n: self.scan.top_n,
            fee_rate: to_decimal(self.trading.market_fee, "trading.market_fee")?,
            floor_ttl: Duration::from_secs(self.gateway.floor_cache_ttl_secs),
            stats_ttl: Duration::from_secs(self.gateway.stats_cache_ttl_secs),
            trending_threshold: self.gateway.trending_threshold,
        })
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_network_retries: self.gateway.max_network_retries,
            retry_base_delay: Duration::from_millis(self.gateway.retry_base_delay_ms),
            max_buys_per_tick: self.trading.max_buys_per_tick,
            dry_run: self.trading.dry_run,
        }
    }

    pub fn valuation_config(&self) -> Result<ValuationConfig> {
        let liq = &self.trading.liquidity;
        let liquidity = match liq.kind {
            LiquidityKind::Flat => LiquidityWeighting::Flat,
            LiquidityKind::Linear => LiquidityWeighting::Linear(LinearCurve {
                velocity_pivot: to_decimal(liq.velocity_pivot, "liquidity.velocity_pivot")?,
                per_sale: to_decimal(liq.per_sale, "liquidity.per_sale")?,
                trending_bonus: to_decimal(liq.trending_bonus, "liquidity.trending_bonus")?,
                min_multiplier: to_decimal(liq.min_multiplier, "liquidity.min_multiplier")?,
                max_multiplier: to_decimal(liq.max_multiplier, "liquidity.max_multiplier")?,
                min_velocity: liq
                    .min_velocity
                    .map(|v| to_decimal(v, "liquidity.min_velocity"))
                    .transpose()?,
                low_velocity_multiplier: to_decimal(
                    liq.low_velocity_multiplier,
                    "liquidity.low_velocity_multiplier",
                )?,
            }),
        };
        Ok(ValuationConfig {
            min_profit: to_decimal(self.trading.min_profit, "trading.min_profit")?,
            max_floor_age: i64::try_from(self.trading.max_floor_age_secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .context("trading.max_floor_age_secs is out of range")?,
            liquidity,
        })
    }
}

fn to_decimal(value: f64, field: &str) -> Result<Decimal> {
    Decimal::from_f64(value)
        .with_context(|| format!("{field} is not representable as a decimal: {value}"))
}
