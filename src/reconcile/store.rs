use chrono::{DateTime, Duration, Timelike, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::StrategyConfig;

/// In-memory mirror of one held ledger order
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveOrder {
    pub order_id: String,
    pub buy_price: f64,
    pub size: Option<f64>,
    pub buy_time: DateTime<Utc>,
    /// When the scheduled exit becomes due
    pub next_decision_time: DateTime<Utc>,
    pub sell_triggered: bool,
}

/// Buy in flight: signal registered, no fill recorded yet
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingBuy {
    pub since: DateTime<Utc>,
    pub limit_price: f64,
}

#[derive(Debug, Default)]
pub struct StoreState {
    pub active: HashMap<String, ActiveOrder>,
    pub pending: HashMap<String, PendingBuy>,
}

/// Working state for one strategy, behind its own lock
///
/// Non-authoritative: the reconciler rewrites it from the ledger.
#[derive(Debug)]
pub struct StrategyStore {
    config: StrategyConfig,
    state: Mutex<StoreState>,
}

impl StrategyStore {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config,
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn flag(&self) -> &str {
        &self.config.flag
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    /// Lock the whole state for a multi-step update
    pub fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Scheduled exit for an order created at `created`
    ///
    /// The creation hour at `sell_minute`, shifted `sell_hours_ahead` hours.
    pub fn next_decision_time(&self, created: DateTime<Utc>) -> DateTime<Utc> {
        let minute = self.config.sell_minute.min(59);
        let anchor = created
            .with_minute(minute)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(created);
        anchor + Duration::hours(self.config.sell_hours_ahead)
    }

    /// Pending or active, i.e. the strategy is already busy with it
    pub fn has_entry(&self, instrument: &str) -> bool {
        let state = self.lock();
        state.active.contains_key(instrument) || state.pending.contains_key(instrument)
    }

    pub fn active(&self, instrument: &str) -> Option<ActiveOrder> {
        self.lock().active.get(instrument).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_pending(&self, instrument: &str) -> bool {
        self.lock().pending.contains_key(instrument)
    }

    /// False if the instrument is already pending or active
    pub fn add_pending(&self, instrument: &str, limit_price: f64, now: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        if state.active.contains_key(instrument) || state.pending.contains_key(instrument) {
            return false;
        }
        state
            .pending
            .insert(instrument.to_string(), PendingBuy { since: now, limit_price });
        true
    }

    pub fn remove_pending(&self, instrument: &str) -> Option<PendingBuy> {
        self.lock().pending.remove(instrument)
    }

    /// Record a buy fill; a later tranche replaces the order id and adds size
    ///
    /// Recording an order id the entry already holds changes nothing.
    pub fn record_fill(
        &self,
        instrument: &str,
        order_id: &str,
        price: f64,
        size: f64,
        at: DateTime<Utc>,
    ) -> ActiveOrder {
        let next_decision_time = self.next_decision_time(at);
        let mut state = self.lock();
        state.pending.remove(instrument);

        let order = state
            .active
            .entry(instrument.to_string())
            .and_modify(|o| {
                // already restored from this very row
                if o.order_id != order_id {
                    o.order_id = order_id.to_string();
                    o.size = Some(o.size.unwrap_or(0.0) + size);
                }
            })
            .or_insert_with(|| ActiveOrder {
                order_id: order_id.to_string(),
                buy_price: price,
                size: Some(size),
                buy_time: at,
                next_decision_time,
                sell_triggered: false,
            });
        order.clone()
    }

    pub fn remove_active(&self, instrument: &str) -> Option<ActiveOrder> {
        self.lock().active.remove(instrument)
    }

    /// Active orders whose exit is due, flagged so each is returned once
    pub fn take_due_sells(&self, now: DateTime<Utc>) -> Vec<(String, ActiveOrder)> {
        let mut state = self.lock();
        let mut due = Vec::new();
        for (instrument, order) in state.active.iter_mut() {
            if !order.sell_triggered && order.next_decision_time <= now {
                order.sell_triggered = true;
                due.push((instrument.clone(), order.clone()));
            }
        }
        due.sort_by(|a, b| a.0.cmp(&b.0));
        due
    }

    /// Re-arm an exit after the sell attempt failed
    pub fn clear_sell_trigger(&self, instrument: &str) {
        if let Some(order) = self.lock().active.get_mut(instrument) {
            order.sell_triggered = false;
        }
    }
}
