use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Runtime settings for the trading core
///
/// Loaded from an optional TOML file layered under `LIMITBOT__*`
/// environment variables. Every field has a default, so an empty
/// configuration is valid.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub feed: FeedConfig,
    pub gate: GateConfig,
    pub batch: BatchConfig,
    pub reference: ReferenceConfig,
    pub reconcile: ReconcileConfig,
    pub database: DatabaseConfig,
    pub strategies: Vec<StrategyConfig>,
    /// instrument -> limit percent of the reference price (e.g. 97.5)
    pub instruments: BTreeMap<String, f64>,
}

impl Settings {
    /// Build settings from `path` (if it exists) and the environment
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("LIMITBOT").separator("__"))
            .build()?
            .try_deserialize()?;

        Ok(settings.with_default_strategies())
    }

    fn with_default_strategies(mut self) -> Self {
        if self.strategies.is_empty() {
            self.strategies = StrategyConfig::defaults();
        }
        self
    }
}

/// Reconnect and subscription parameters for push feeds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub ticker_url: String,
    pub candle_url: String,
    pub initial_delay_secs: f64,
    pub max_delay_secs: f64,
    pub multiplier: f64,
    /// Connection uptime after which the next backoff starts over
    pub min_stable_secs: f64,
    pub heartbeat_secs: u64,
    /// Reconnect when no frame arrives for this long
    pub idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub subscribe_batch_size: usize,
    pub subscribe_batch_pause_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ticker_url: "wss://ws.okx.com:8443/ws/v5/public".to_string(),
            candle_url: "wss://ws.okx.com:8443/ws/v5/business".to_string(),
            initial_delay_secs: 1.0,
            max_delay_secs: 300.0,
            multiplier: 2.0,
            min_stable_secs: 60.0,
            heartbeat_secs: 20,
            idle_timeout_secs: 60,
            connect_timeout_secs: 10,
            subscribe_batch_size: 100,
            subscribe_batch_pause_ms: 100,
        }
    }
}

impl FeedConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs_f64(self.initial_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.max_delay_secs)
    }

    pub fn min_stable(&self) -> Duration {
        Duration::from_secs_f64(self.min_stable_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn subscribe_batch_pause(&self) -> Duration {
        Duration::from_millis(self.subscribe_batch_pause_ms)
    }
}

/// Accelerated-drop and stability thresholds
///
/// Drop thresholds are fractional returns (`-0.0015` = -0.15%).
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub history_window_secs: f64,
    pub volatility_window_secs: f64,
    pub volatility_min_samples: usize,
    pub volatility_multiplier: f64,
    pub drop_1s_base: f64,
    pub drop_3s_base: f64,
    pub stable_drop_base: f64,
    pub required_stable_secs: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            history_window_secs: 15.0,
            volatility_window_secs: 10.0,
            volatility_min_samples: 5,
            volatility_multiplier: 2.0,
            drop_1s_base: -0.0015,
            drop_3s_base: -0.0030,
            stable_drop_base: -0.0005,
            required_stable_secs: 10.0,
        }
    }
}

/// Tranche sizes (quote currency) and pacing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub tranche_amounts: Vec<f64>,
    pub tranche_delay_secs: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            tranche_amounts: vec![30.0, 30.0, 40.0],
            tranche_delay_secs: 600.0,
        }
    }
}

/// Reference-price REST fetch and gain filter
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub rest_url: String,
    /// Exchange bar label for one period (e.g. `1H`)
    pub bar: String,
    pub period_secs: i64,
    pub gain_lookback_periods: usize,
    pub gain_threshold_pct: f64,
    pub request_timeout_secs: u64,
    pub requests_per_second: u32,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://www.okx.com".to_string(),
            bar: "1H".to_string(),
            period_secs: 3600,
            gain_lookback_periods: 2,
            gain_threshold_pct: 5.0,
            request_timeout_secs: 10,
            requests_per_second: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/limitbot".to_string(),
            max_connections: 5,
        }
    }
}

/// One strategy whose in-memory orders mirror ledger rows tagged `flag`
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StrategyConfig {
    pub flag: String,
    pub label: String,
    /// Scheduled sell lands `sell_hours_ahead` hours after the buy hour...
    #[serde(default = "default_sell_hours_ahead")]
    pub sell_hours_ahead: i64,
    /// ...at this minute of the hour
    #[serde(default = "default_sell_minute")]
    pub sell_minute: u32,
}

fn default_sell_hours_ahead() -> i64 {
    1
}

fn default_sell_minute() -> u32 {
    55
}

impl StrategyConfig {
    pub fn new(flag: &str, label: &str) -> Self {
        Self {
            flag: flag.to_string(),
            label: label.to_string(),
            sell_hours_ahead: default_sell_hours_ahead(),
            sell_minute: default_sell_minute(),
        }
    }

    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("hourly_limit_ws", "hourly"),
            Self::new("stable_buy_ws", "stable"),
            Self::new("batch_buy_ws", "batch"),
        ]
    }
}
