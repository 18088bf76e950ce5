use chrono::{DateTime, Duration, Utc};

use crate::config::BatchConfig;

/// One slice of a batched buy, ready to place
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tranche {
    pub index: usize,
    pub amount: f64,
    pub limit_price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchState {
    pub current_index: usize,
    pub filled: Vec<bool>,
    pub last_fill_time: DateTime<Utc>,
    pub limit_price: f64,
    pub trigger_time: DateTime<Utc>,
}

impl BatchState {
    fn is_complete(&self) -> bool {
        self.filled.iter().all(|f| *f)
    }
}

/// Paces a buy decision into fixed tranches for one instrument
///
/// Tranche 0 is due as soon as the batch is registered. Each later
/// tranche waits `tranche_delay_secs` after the previous fill.
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    instrument: String,
    config: BatchConfig,
    state: Option<BatchState>,
}

impl BatchScheduler {
    pub fn new(instrument: impl Into<String>, config: BatchConfig) -> Self {
        Self {
            instrument: instrument.into(),
            config,
            state: None,
        }
    }

    pub fn state(&self) -> Option<&BatchState> {
        self.state.as_ref()
    }

    /// Start a batch; false if one already exists for this instrument
    pub fn register_buy_signal_at(&mut self, limit_price: f64, now: DateTime<Utc>) -> bool {
        if self.state.is_some() {
            tracing::debug!(instrument = %self.instrument, "⏳ Batch buy already active, skipping");
            return false;
        }

        self.state = Some(BatchState {
            current_index: 0,
            filled: vec![false; self.config.tranche_amounts.len()],
            last_fill_time: now,
            limit_price,
            trigger_time: now,
        });

        tracing::warn!(
            instrument = %self.instrument,
            "📝 Batch buy registered: limit={:.6}, tranches={:?}",
            limit_price,
            self.config.tranche_amounts
        );
        true
    }

    /// Next unfilled tranche, if its delay has elapsed
    pub fn get_next_batch_at(&mut self, now: DateTime<Utc>) -> Option<Tranche> {
        let delay = Duration::milliseconds((self.config.tranche_delay_secs * 1000.0).round() as i64);
        let state = self.state.as_mut()?;

        while state.filled.get(state.current_index) == Some(&true) {
            state.current_index += 1;
        }
        let index = state.current_index;
        let amount = *self.config.tranche_amounts.get(index)?;

        if index > 0 && now - state.last_fill_time < delay {
            return None;
        }

        Some(Tranche {
            index,
            amount,
            limit_price: state.limit_price,
        })
    }

    pub fn mark_batch_filled_at(&mut self, index: usize, now: DateTime<Utc>) {
        let total = self.config.tranche_amounts.len();
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let Some(slot) = state.filled.get_mut(index) else {
            tracing::warn!(instrument = %self.instrument, "Ignoring fill for unknown tranche {}", index);
            return;
        };

        *slot = true;
        state.last_fill_time = now;

        tracing::warn!(
            instrument = %self.instrument,
            "✅ Tranche {}/{} filled: amount={}",
            index + 1,
            total,
            self.config.tranche_amounts[index]
        );

        if state.is_complete() {
            tracing::warn!(
                instrument = %self.instrument,
                "🎉 All tranches filled: total={}",
                self.get_total_amount()
            );
        }
    }

    /// True while some tranche is still unfilled
    pub fn is_batch_active(&self) -> bool {
        self.state.as_ref().is_some_and(|s| !s.is_complete())
    }

    pub fn get_total_amount(&self) -> f64 {
        self.config.tranche_amounts.iter().sum()
    }

    /// Drop batch state once the position is closed or the instrument removed
    pub fn reset(&mut self) {
        if self.state.take().is_some() {
            tracing::debug!(instrument = %self.instrument, "🔄 Reset batch buy state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(s: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(s)
    }

    fn scheduler() -> BatchScheduler {
        BatchScheduler::new("BTC-USDT", BatchConfig::default())
    }

    #[test]
    fn test_three_tranches_in_order_then_nothing() {
        let mut batch = scheduler();
        assert!(batch.register_buy_signal_at(100.0, t(0)));

        let mut seen = Vec::new();
        let mut now = t(0);
        for _ in 0..3 {
            let tranche = batch.get_next_batch_at(now).unwrap();
            seen.push((tranche.index, tranche.amount));
            batch.mark_batch_filled_at(tranche.index, now);
            now += Duration::seconds(600);
        }

        assert_eq!(seen, vec![(0, 30.0), (1, 30.0), (2, 40.0)]);
        assert_eq!(batch.get_next_batch_at(now), None);
        assert!(!batch.is_batch_active());
    }

    #[test]
    fn test_next_tranche_waits_for_delay() {
        let mut batch = scheduler();
        batch.register_buy_signal_at(100.0, t(0));
        batch.mark_batch_filled_at(0, t(10));

        assert_eq!(batch.get_next_batch_at(t(609)), None);
        assert_eq!(
            batch.get_next_batch_at(t(610)),
            Some(Tranche {
                index: 1,
                amount: 30.0,
                limit_price: 100.0
            })
        );
    }

    #[test]
    fn test_first_tranche_is_immediate_and_repeats_until_filled() {
        let mut batch = scheduler();
        batch.register_buy_signal_at(50.0, t(0));

        assert_eq!(batch.get_next_batch_at(t(0)).unwrap().index, 0);
        assert_eq!(batch.get_next_batch_at(t(1)).unwrap().index, 0);
        assert!(batch.is_batch_active());
    }

    #[test]
    fn test_duplicate_register_is_noop() {
        let mut batch = scheduler();
        assert!(batch.register_buy_signal_at(100.0, t(0)));
        assert!(!batch.register_buy_signal_at(90.0, t(5)));
        assert_eq!(batch.state().unwrap().limit_price, 100.0);
    }

    #[test]
    fn test_unknown_tranche_and_reset() {
        let mut batch = scheduler();
        batch.mark_batch_filled_at(0, t(0));
        assert!(batch.state().is_none());

        batch.register_buy_signal_at(100.0, t(0));
        batch.mark_batch_filled_at(7, t(0));
        assert_eq!(batch.state().unwrap().filled, vec![false, false, false]);

        assert_eq!(batch.get_total_amount(), 100.0);
        batch.reset();
        assert!(!batch.is_batch_active());
        assert_eq!(batch.get_next_batch_at(t(1)), None);
    }
}
