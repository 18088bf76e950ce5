use chrono::{DateTime, Utc};

use super::history::PriceHistory;
use crate::config::GateConfig;
use crate::models::PricePoint;

/// Minimum spacing between two stability evaluations
const CHECK_INTERVAL_SECS: f64 = 1.0;

/// A buy signal waiting for the price to settle
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSignal {
    pub trigger_time: DateTime<Utc>,
    pub trigger_price: f64,
    pub limit_price: f64,
    pub stable_seconds: f64,
    pub last_check_time: DateTime<Utc>,
}

/// Result of polling the gate for one instrument
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StabilityStatus {
    NoSignal,
    /// Accelerated drop in progress; accumulated stability was reset
    Blocked,
    Pending { stable_seconds: f64 },
    /// Signal consumed; buy at this price
    Ready { price: f64 },
}

/// `min(base, -multiplier * volatility)`, or `base` when volatility is unknown
///
/// Both sides are negative "allowed drop" bounds, so the result is the
/// more permissive one.
pub fn dynamic_threshold(base: f64, volatility: Option<f64>, multiplier: f64) -> f64 {
    match volatility {
        Some(vol) => base.min(-multiplier * vol),
        None => base,
    }
}

/// Accelerated-drop detector and buy-signal debouncer for one instrument
#[derive(Debug, Clone)]
pub struct StabilityGate {
    instrument: String,
    config: GateConfig,
    history: PriceHistory,
    pending: Option<PendingSignal>,
}

impl StabilityGate {
    pub fn new(instrument: impl Into<String>, config: GateConfig) -> Self {
        Self {
            instrument: instrument.into(),
            history: PriceHistory::new(config.history_window_secs),
            config,
            pending: None,
        }
    }

    pub fn update_price_at(&mut self, price: f64, at: DateTime<Utc>) {
        self.history.push(PricePoint::new(at, price));
    }

    pub fn latest_price(&self) -> Option<f64> {
        self.history.latest().map(|p| p.price)
    }

    pub fn pending(&self) -> Option<&PendingSignal> {
        self.pending.as_ref()
    }

    pub fn volatility_at(&self, now: DateTime<Utc>) -> Option<f64> {
        self.history.volatility(
            now,
            self.config.volatility_window_secs,
            self.config.volatility_min_samples,
        )
    }

    pub fn dynamic_threshold_at(&self, base: f64, now: DateTime<Utc>) -> f64 {
        dynamic_threshold(base, self.volatility_at(now), self.config.volatility_multiplier)
    }

    pub fn is_accelerated_drop_at(&self, now: DateTime<Utc>) -> bool {
        if let Some(drop_1s) = self.history.trailing_return(now, 1.0) {
            let threshold = self.dynamic_threshold_at(self.config.drop_1s_base, now);
            if drop_1s <= threshold {
                tracing::debug!(
                    instrument = %self.instrument,
                    "🚫 Accelerated drop (1s): {:.3}% <= {:.3}%",
                    drop_1s * 100.0,
                    threshold * 100.0
                );
                return true;
            }
        }

        if let Some(drop_3s) = self.history.trailing_return(now, 3.0) {
            let threshold = self.dynamic_threshold_at(self.config.drop_3s_base, now);
            if drop_3s <= threshold {
                tracing::debug!(
                    instrument = %self.instrument,
                    "🚫 Accelerated drop (3s): {:.3}% <= {:.3}%",
                    drop_3s * 100.0,
                    threshold * 100.0
                );
                return true;
            }
        }

        false
    }

    /// Start waiting for stability; false if blocked, already pending or no price yet
    pub fn register_buy_signal_at(&mut self, limit_price: f64, now: DateTime<Utc>) -> bool {
        if self.is_accelerated_drop_at(now) {
            tracing::debug!(instrument = %self.instrument, "🚫 Buy signal blocked: accelerated drop");
            return false;
        }

        if self.pending.is_some() {
            tracing::debug!(instrument = %self.instrument, "⏳ Buy signal already pending");
            return false;
        }

        let Some(current) = self.latest_price() else {
            tracing::debug!(instrument = %self.instrument, "⏳ No price history yet");
            return false;
        };

        self.pending = Some(PendingSignal {
            trigger_time: now,
            trigger_price: current,
            limit_price,
            stable_seconds: 0.0,
            last_check_time: now,
        });

        tracing::warn!(
            instrument = %self.instrument,
            "📝 Buy signal registered, waiting for stability (limit={:.6}, current={:.6})",
            limit_price,
            current
        );
        true
    }

    /// Advance the pending signal; poll at 1 Hz or faster
    pub fn check_stability_at(&mut self, now: DateTime<Utc>) -> StabilityStatus {
        if self.pending.is_none() {
            return StabilityStatus::NoSignal;
        }

        let accelerated = self.is_accelerated_drop_at(now);
        let trailing = self.history.trailing_return(now, 1.0);
        let stable_bound = self.dynamic_threshold_at(self.config.stable_drop_base, now);
        let latest = self.latest_price();

        let Some(signal) = self.pending.as_mut() else {
            return StabilityStatus::NoSignal;
        };

        if accelerated {
            signal.stable_seconds = 0.0;
            signal.last_check_time = now;
            return StabilityStatus::Blocked;
        }

        let elapsed = (now - signal.last_check_time).num_milliseconds() as f64 / 1000.0;
        if elapsed < CHECK_INTERVAL_SECS {
            return StabilityStatus::Pending {
                stable_seconds: signal.stable_seconds,
            };
        }

        // nothing measured over the last second yet
        let Some(trailing) = trailing else {
            signal.last_check_time = now;
            return StabilityStatus::Pending {
                stable_seconds: signal.stable_seconds,
            };
        };

        if trailing >= stable_bound {
            signal.stable_seconds += elapsed;
        } else {
            tracing::debug!(
                instrument = %self.instrument,
                "⏸️ Drop rate too fast: {:.3}% < {:.3}%, resetting stability",
                trailing * 100.0,
                stable_bound * 100.0
            );
            signal.stable_seconds = 0.0;
        }
        signal.last_check_time = now;

        if signal.stable_seconds < self.config.required_stable_secs {
            return StabilityStatus::Pending {
                stable_seconds: signal.stable_seconds,
            };
        }

        let stable_seconds = signal.stable_seconds;
        let limit = signal.limit_price;
        let price = latest.map_or(limit, |p| p.min(limit));
        self.pending = None;

        tracing::warn!(
            instrument = %self.instrument,
            "✅ Price stable, ready to buy (stable for {:.1}s, price={:.6}, limit={:.6})",
            stable_seconds,
            price,
            limit
        );
        StabilityStatus::Ready { price }
    }

    pub fn clear_signal(&mut self) {
        if self.pending.take().is_some() {
            tracing::debug!(instrument = %self.instrument, "🗑️ Cleared pending buy signal");
        }
    }

    /// Forget price history and any pending signal
    pub fn reset(&mut self) {
        self.history = PriceHistory::new(self.config.history_window_secs);
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(s: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(s)
    }

    fn gate_with_flat_history(until: i64, price: f64) -> StabilityGate {
        let mut gate = StabilityGate::new("BTC-USDT", GateConfig::default());
        for s in 0..=until {
            gate.update_price_at(price, t(s));
        }
        gate
    }

    #[test]
    fn test_one_percent_drop_is_accelerated_until_it_ages_out() {
        let mut gate = gate_with_flat_history(9, 100.0);
        assert!(!gate.is_accelerated_drop_at(t(9)));

        gate.update_price_at(99.0, t(10));
        assert!(gate.is_accelerated_drop_at(t(10)));

        // flat at the new level: the 3s window still sees the drop
        gate.update_price_at(99.0, t(11));
        assert!(gate.is_accelerated_drop_at(t(11)));
        gate.update_price_at(99.0, t(12));
        assert!(gate.is_accelerated_drop_at(t(12)));

        gate.update_price_at(99.0, t(13));
        assert!(!gate.is_accelerated_drop_at(t(13)));
    }

    #[test]
    fn test_register_rejections() {
        let mut empty = StabilityGate::new("BTC-USDT", GateConfig::default());
        assert!(!empty.register_buy_signal_at(100.0, t(0)));

        let mut gate = gate_with_flat_history(5, 100.0);
        assert!(gate.register_buy_signal_at(100.0, t(5)));
        assert!(!gate.register_buy_signal_at(100.0, t(5)));

        let mut dropping = gate_with_flat_history(5, 100.0);
        dropping.update_price_at(98.0, t(6));
        assert!(!dropping.register_buy_signal_at(100.0, t(6)));
        assert!(dropping.pending().is_none());
    }

    #[test]
    fn test_flat_series_becomes_ready_exactly_once() {
        let mut gate = gate_with_flat_history(5, 100.0);
        assert!(gate.register_buy_signal_at(101.0, t(5)));

        let mut ready = Vec::new();
        for s in 6..=20 {
            gate.update_price_at(100.0, t(s));
            if let StabilityStatus::Ready { price } = gate.check_stability_at(t(s)) {
                ready.push((s, price));
            }
        }

        assert_eq!(ready, vec![(15, 100.0)]);
        assert!(ready[0].1 <= 101.0);
        assert_eq!(gate.check_stability_at(t(21)), StabilityStatus::NoSignal);
    }

    #[test]
    fn test_single_observed_price_never_becomes_ready() {
        let mut gate = StabilityGate::new("BTC-USDT", GateConfig::default());
        gate.update_price_at(100.0, t(0));
        assert!(gate.register_buy_signal_at(100.0, t(0)));

        for s in 1..=12 {
            assert_eq!(
                gate.check_stability_at(t(s)),
                StabilityStatus::Pending { stable_seconds: 0.0 }
            );
        }

        // accumulation starts with the second observed price
        gate.update_price_at(100.0, t(13));
        assert_eq!(
            gate.check_stability_at(t(13)),
            StabilityStatus::Pending { stable_seconds: 1.0 }
        );
    }

    #[test]
    fn test_ready_price_never_exceeds_limit() {
        let mut gate = gate_with_flat_history(5, 100.0);
        assert!(gate.register_buy_signal_at(95.0, t(5)));

        let mut result = StabilityStatus::NoSignal;
        for s in 6..=15 {
            gate.update_price_at(100.0, t(s));
            result = gate.check_stability_at(t(s));
        }

        assert_eq!(result, StabilityStatus::Ready { price: 95.0 });
    }

    #[test]
    fn test_checks_within_a_second_do_not_accumulate() {
        let mut gate = gate_with_flat_history(5, 100.0);
        gate.register_buy_signal_at(100.0, t(5));

        gate.update_price_at(100.0, t(6));
        assert_eq!(
            gate.check_stability_at(t(6)),
            StabilityStatus::Pending { stable_seconds: 1.0 }
        );
        let half = t(6) + Duration::milliseconds(500);
        assert_eq!(
            gate.check_stability_at(half),
            StabilityStatus::Pending { stable_seconds: 1.0 }
        );
    }

    #[test]
    fn test_drop_resets_accumulated_stability() {
        let mut gate = gate_with_flat_history(5, 100.0);
        gate.register_buy_signal_at(100.0, t(5));

        for s in 6..=9 {
            gate.update_price_at(100.0, t(s));
            gate.check_stability_at(t(s));
        }
        assert_eq!(gate.pending().unwrap().stable_seconds, 4.0);

        gate.update_price_at(98.5, t(10));
        assert_eq!(gate.check_stability_at(t(10)), StabilityStatus::Blocked);
        assert_eq!(gate.pending().unwrap().stable_seconds, 0.0);
    }

    #[test]
    fn test_dynamic_threshold_is_monotonic_in_volatility() {
        let base = -0.0015;
        let calm = dynamic_threshold(base, Some(0.0005), 2.0);
        let doubled = dynamic_threshold(base, Some(0.001), 2.0);
        let wild = dynamic_threshold(base, Some(0.002), 2.0);

        assert_eq!(calm, base);
        assert!(doubled <= calm);
        assert!(wild <= doubled);
        assert_eq!(dynamic_threshold(base, None, 2.0), base);
    }

    #[test]
    fn test_doubling_history_volatility_loosens_threshold() {
        let zigzag = |amplitude: f64| {
            let mut gate = StabilityGate::new("ETH-USDT", GateConfig::default());
            for s in 0..=10 {
                let price = if s % 2 == 0 { 100.0 } else { 100.0 * (1.0 + amplitude) };
                gate.update_price_at(price, t(s));
            }
            gate
        };

        let base = GateConfig::default().drop_1s_base;
        let low = zigzag(0.002).dynamic_threshold_at(base, t(10));
        let high = zigzag(0.004).dynamic_threshold_at(base, t(10));

        assert!(high <= low);
        assert!(low < base);
    }

    #[test]
    fn test_clear_and_reset() {
        let mut gate = gate_with_flat_history(5, 100.0);
        gate.register_buy_signal_at(100.0, t(5));

        gate.clear_signal();
        assert!(gate.pending().is_none());
        assert_eq!(gate.check_stability_at(t(6)), StabilityStatus::NoSignal);

        gate.reset();
        assert_eq!(gate.latest_price(), None);
    }
}
