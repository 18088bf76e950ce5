use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::api::CandleSource;
use crate::config::ReferenceConfig;
use crate::models::Candle;

/// Allowed distance between a candle's period and the expected period
const PERIOD_TOLERANCE_SECS: i64 = 60;
/// Retry wait after a failed reference fetch: `min(5 * 2^min(failures, 4), 60)` seconds
const REFETCH_BASE_SECS: i64 = 5;
const REFETCH_MAX_EXPONENT: u32 = 4;
const REFETCH_CAP_SECS: i64 = 60;

/// Cached reference price and fetch bookkeeping for one instrument
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceEntry {
    pub price: Option<f64>,
    pub last_fetch_time: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Outcome of the lookback gain filter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainCheck {
    pub should_skip: bool,
    /// `None` when the lookback close was unavailable
    pub gain_pct: Option<f64>,
}

/// Period-open reference prices per instrument
///
/// REST failures and wrong-period candles both read as "unavailable";
/// callers decide how to degrade.
pub struct ReferencePriceCache<S> {
    source: S,
    config: ReferenceConfig,
    entries: Mutex<HashMap<String, ReferenceEntry>>,
}

impl<S: CandleSource> ReferencePriceCache<S> {
    pub fn new(source: S, config: ReferenceConfig) -> Self {
        Self {
            source,
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, ReferenceEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn period_start(&self, ts: DateTime<Utc>) -> i64 {
        let period = self.config.period_secs.max(1);
        ts.timestamp().div_euclid(period) * period
    }

    pub async fn fetch_current_period_open(&self, instrument: &str) -> Option<f64> {
        self.fetch_current_period_open_at(instrument, Utc::now()).await
    }

    /// Open of the period containing `now`, if the feed returns that period's candle
    pub async fn fetch_current_period_open_at(
        &self,
        instrument: &str,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let candle = self.fetch_candle(instrument, 0).await?;

        let expected = self.period_start(now);
        let got = self.period_start(candle.timestamp);
        if (got - expected).abs() > PERIOD_TOLERANCE_SECS {
            tracing::warn!(
                instrument,
                "⚠️ Got a different period's candle: expected start={}, got start={}, open={:.6}",
                expected,
                got,
                candle.open
            );
            return None;
        }

        if candle.open <= 0.0 {
            return None;
        }

        tracing::info!(
            instrument,
            "📊 Current period open: ${:.6} (ts={})",
            candle.open,
            candle.timestamp.format("%H:%M:%S")
        );
        Some(candle.open)
    }

    pub async fn fetch_close_n_periods_ago(&self, instrument: &str, n: usize) -> Option<f64> {
        self.fetch_close_n_periods_ago_at(instrument, n, Utc::now()).await
    }

    /// Close of the candle `n` periods before the current one
    ///
    /// The candle must start between `n - 0.5` and `n + 0.5` periods before
    /// the current period start.
    pub async fn fetch_close_n_periods_ago_at(
        &self,
        instrument: &str,
        n: usize,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let candle = self.fetch_candle(instrument, n).await?;

        let period = self.config.period_secs.max(1) as f64;
        let offset = (self.period_start(now) - candle.timestamp.timestamp()) as f64 / period;
        let target = n as f64;
        if offset < target - 0.5 || offset > target + 0.5 {
            tracing::warn!(
                instrument,
                "⚠️ Lookback candle is {:.2} periods old, expected {}",
                offset,
                n
            );
            return None;
        }

        (candle.close > 0.0).then_some(candle.close)
    }

    /// Candle at `offset` in a newest-first response, or `None` on any failure
    async fn fetch_candle(&self, instrument: &str, offset: usize) -> Option<Candle> {
        match self
            .source
            .recent_candles(instrument, &self.config.bar, offset + 1)
            .await
        {
            Ok(candles) => {
                let candle = candles.into_iter().nth(offset);
                if candle.is_none() {
                    tracing::warn!(instrument, "⚠️ Candle response shorter than {}", offset + 1);
                }
                candle
            }
            Err(e) => {
                tracing::warn!(instrument, "⚠️ Failed to fetch candles: {}", e);
                None
            }
        }
    }

    pub async fn check_gain_filter(
        &self,
        instrument: &str,
        current_open: f64,
        threshold_pct: f64,
    ) -> GainCheck {
        self.check_gain_filter_at(instrument, current_open, threshold_pct, Utc::now())
            .await
    }

    /// Skip buys after a run-up of more than `threshold_pct` over the lookback
    ///
    /// Fails open: a missing lookback close never blocks.
    pub async fn check_gain_filter_at(
        &self,
        instrument: &str,
        current_open: f64,
        threshold_pct: f64,
        now: DateTime<Utc>,
    ) -> GainCheck {
        let lookback = self.config.gain_lookback_periods;
        let Some(close_n_ago) = self.fetch_close_n_periods_ago_at(instrument, lookback, now).await
        else {
            tracing::warn!(
                instrument,
                "⚠️ Lookback close unavailable, gain filter not applied"
            );
            return GainCheck {
                should_skip: false,
                gain_pct: None,
            };
        };

        let gain_pct = (current_open - close_n_ago) / close_n_ago * 100.0;
        GainCheck {
            should_skip: gain_pct > threshold_pct,
            gain_pct: Some(gain_pct),
        }
    }

    pub fn get(&self, instrument: &str) -> Option<f64> {
        self.entries().get(instrument).and_then(|e| e.price)
    }

    pub fn set(&self, instrument: &str, price: f64) {
        let mut entries = self.entries();
        let entry = entries.entry(instrument.to_string()).or_default();
        entry.price = Some(price);
        entry.consecutive_failures = 0;
    }

    /// Drop the price and all fetch bookkeeping
    pub fn remove(&self, instrument: &str) {
        self.entries().remove(instrument);
    }

    pub fn entry(&self, instrument: &str) -> Option<ReferenceEntry> {
        self.entries().get(instrument).cloned()
    }

    /// Ticker activity shows the instrument is live; forget past fetch failures
    pub fn note_activity(&self, instrument: &str) {
        if let Some(entry) = self.entries().get_mut(instrument) {
            if entry.consecutive_failures > 0 {
                tracing::debug!(instrument, "📊 Reset reference fetch failures on activity");
                entry.consecutive_failures = 0;
            }
        }
    }

    /// Take a pushed candle as the reference if it belongs to the current period
    pub fn apply_candle_at(&self, candle: &Candle, now: DateTime<Utc>) -> bool {
        let diff = (self.period_start(candle.timestamp) - self.period_start(now)).abs();
        if diff > PERIOD_TOLERANCE_SECS || candle.open <= 0.0 {
            return false;
        }

        self.set(&candle.instrument, candle.open);
        tracing::debug!(
            instrument = %candle.instrument,
            "📊 Updated reference price from feed: ${:.6}",
            candle.open
        );
        true
    }

    pub async fn refresh_if_due(&self, instrument: &str) -> Option<f64> {
        self.refresh_if_due_at(instrument, Utc::now()).await
    }

    /// Cached reference, or a fresh fetch once the failure backoff allows it
    pub async fn refresh_if_due_at(&self, instrument: &str, now: DateTime<Utc>) -> Option<f64> {
        {
            let mut entries = self.entries();
            let entry = entries.entry(instrument.to_string()).or_default();

            if let Some(price) = entry.price.filter(|p| *p > 0.0) {
                return Some(price);
            }

            if let Some(last) = entry.last_fetch_time {
                let wait = refetch_wait(entry.consecutive_failures);
                if now - last < wait {
                    tracing::debug!(
                        instrument,
                        "⏳ Skipping reference fetch: backoff ({}s)",
                        wait.num_seconds()
                    );
                    return None;
                }
            }

            entry.last_fetch_time = Some(now);
        }

        tracing::warn!(instrument, "⚠️ No reference price, fetching current period open...");
        let fetched = self.fetch_current_period_open_at(instrument, now).await;

        let mut entries = self.entries();
        let entry = entries.entry(instrument.to_string()).or_default();
        match fetched {
            Some(price) => {
                entry.price = Some(price);
                entry.consecutive_failures = 0;
            }
            None => {
                entry.consecutive_failures += 1;
                tracing::warn!(
                    instrument,
                    "⚠️ Failed to get reference price (attempts={}), will retry after backoff",
                    entry.consecutive_failures
                );
            }
        }
        fetched
    }

    /// Warm the cache for every instrument; returns how many succeeded
    pub async fn initialize(&self, instruments: &[String]) -> usize {
        tracing::info!("🔄 Initializing reference prices for {} instruments...", instruments.len());

        let mut count = 0;
        for instrument in instruments {
            if let Some(price) = self.fetch_current_period_open(instrument).await {
                self.set(instrument, price);
                count += 1;
            }
        }

        tracing::info!("✅ Initialized {}/{} reference prices", count, instruments.len());
        count
    }
}

fn refetch_wait(failures: u32) -> Duration {
    let secs = REFETCH_BASE_SECS * 2_i64.pow(failures.min(REFETCH_MAX_EXPONENT));
    Duration::seconds(secs.min(REFETCH_CAP_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubSource {
        candles: Vec<Candle>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl StubSource {
        fn new(candles: Vec<Candle>) -> Self {
            Self {
                candles,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(Vec::new())
            }
        }
    }

    impl CandleSource for StubSource {
        async fn recent_candles(
            &self,
            _instrument: &str,
            _bar: &str,
            limit: usize,
        ) -> crate::Result<Vec<Candle>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err("exchange unavailable".into());
            }
            Ok(self.candles.iter().take(limit).cloned().collect())
        }
    }

    /// 12:20 UTC; current period starts at 12:00
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 20, 0).unwrap()
    }

    fn candle_at(hour: u32, open: f64, close: f64) -> Candle {
        Candle {
            instrument: "BTC-USDT".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap(),
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume: 1.0,
            confirmed: hour < 12,
        }
    }

    /// Newest first: 12:00, 11:00, 10:00
    fn hourly(close_two_ago: f64) -> Vec<Candle> {
        vec![
            candle_at(12, 50000.0, 50100.0),
            candle_at(11, 49000.0, 50000.0),
            candle_at(10, 47500.0, close_two_ago),
        ]
    }

    fn cache(source: StubSource) -> ReferencePriceCache<StubSource> {
        ReferencePriceCache::new(source, ReferenceConfig::default())
    }

    #[tokio::test]
    async fn test_current_period_open() {
        let cache = cache(StubSource::new(hourly(48000.0)));
        assert_eq!(
            cache.fetch_current_period_open_at("BTC-USDT", now()).await,
            Some(50000.0)
        );
    }

    #[tokio::test]
    async fn test_wrong_period_candle_is_unavailable() {
        let cache = cache(StubSource::new(vec![candle_at(11, 49000.0, 50000.0)]));
        assert_eq!(cache.fetch_current_period_open_at("BTC-USDT", now()).await, None);
    }

    #[tokio::test]
    async fn test_close_two_periods_ago() {
        let cache = cache(StubSource::new(hourly(48000.0)));
        assert_eq!(
            cache.fetch_close_n_periods_ago_at("BTC-USDT", 2, now()).await,
            Some(48000.0)
        );
    }

    #[tokio::test]
    async fn test_lookback_candle_outside_window_is_unavailable() {
        // Offset 2 in the response is actually four hours back
        let candles = vec![
            candle_at(12, 50000.0, 50100.0),
            candle_at(9, 49000.0, 50000.0),
            candle_at(8, 47500.0, 48000.0),
        ];
        let cache = cache(StubSource::new(candles));
        assert_eq!(cache.fetch_close_n_periods_ago_at("BTC-USDT", 2, now()).await, None);
    }

    #[tokio::test]
    async fn test_gain_filter_allows_moderate_gain() {
        let cache = cache(StubSource::new(hourly(48000.0)));
        let check = cache.check_gain_filter_at("BTC-USDT", 50000.0, 5.0, now()).await;

        assert!(!check.should_skip);
        let gain = check.gain_pct.unwrap();
        assert!((gain - 4.1667).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_gain_filter_blocks_large_gain() {
        let cache = cache(StubSource::new(hourly(47000.0)));
        let check = cache.check_gain_filter_at("BTC-USDT", 50000.0, 5.0, now()).await;

        assert!(check.should_skip);
        assert!((check.gain_pct.unwrap() - 6.383).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_gain_filter_fails_open() {
        let cache = cache(StubSource::failing());
        let check = cache.check_gain_filter_at("BTC-USDT", 50000.0, 5.0, now()).await;

        assert_eq!(
            check,
            GainCheck {
                should_skip: false,
                gain_pct: None
            }
        );
    }

    #[test]
    fn test_remove_clears_bookkeeping() {
        let cache = cache(StubSource::new(Vec::new()));
        cache.set("BTC-USDT", 50000.0);
        assert_eq!(cache.get("BTC-USDT"), Some(50000.0));

        cache.remove("BTC-USDT");
        assert_eq!(cache.get("BTC-USDT"), None);
        assert!(cache.entry("BTC-USDT").is_none());
    }

    #[tokio::test]
    async fn test_refresh_backs_off_after_failure() {
        let cache = cache(StubSource::failing());

        assert_eq!(cache.refresh_if_due_at("BTC-USDT", now()).await, None);
        assert_eq!(cache.entry("BTC-USDT").unwrap().consecutive_failures, 1);

        // 1 failure -> wait 10s
        let soon = now() + Duration::seconds(9);
        assert_eq!(cache.refresh_if_due_at("BTC-USDT", soon).await, None);
        assert_eq!(cache.source.calls.load(Ordering::SeqCst), 1);

        let later = now() + Duration::seconds(10);
        cache.refresh_if_due_at("BTC-USDT", later).await;
        assert_eq!(cache.source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.entry("BTC-USDT").unwrap().consecutive_failures, 2);

        cache.note_activity("BTC-USDT");
        assert_eq!(cache.entry("BTC-USDT").unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_refresh_uses_cache_then_fetches() {
        let cache = cache(StubSource::new(hourly(48000.0)));

        assert_eq!(cache.refresh_if_due_at("BTC-USDT", now()).await, Some(50000.0));
        assert_eq!(cache.refresh_if_due_at("BTC-USDT", now()).await, Some(50000.0));
        assert_eq!(cache.source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refetch_wait_caps_at_sixty_seconds() {
        assert_eq!(refetch_wait(0), Duration::seconds(5));
        assert_eq!(refetch_wait(3), Duration::seconds(40));
        assert_eq!(refetch_wait(4), Duration::seconds(60));
        assert_eq!(refetch_wait(9), Duration::seconds(60));
    }

    #[test]
    fn test_apply_candle_only_for_current_period() {
        let cache = cache(StubSource::new(Vec::new()));

        assert!(!cache.apply_candle_at(&candle_at(11, 49000.0, 50000.0), now()));
        assert_eq!(cache.get("BTC-USDT"), None);

        assert!(cache.apply_candle_at(&candle_at(12, 50000.0, 50100.0), now()));
        assert_eq!(cache.get("BTC-USDT"), Some(50000.0));
    }
}
