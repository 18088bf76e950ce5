use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use super::batch::{BatchScheduler, Tranche};
use super::stability::{StabilityGate, StabilityStatus};
use crate::config::{BatchConfig, GateConfig};

/// All decision state for one instrument, behind one lock
#[derive(Debug)]
pub struct InstrumentSession {
    pub gate: StabilityGate,
    pub batch: BatchScheduler,
}

/// Per-instrument sessions keyed by instrument id
///
/// Every operation on an instrument goes through that instrument's mutex,
/// so a decision cycle (check stability, then schedule a tranche) runs
/// as one critical section. Different instruments never contend.
pub struct SessionBook {
    gate_config: GateConfig,
    batch_config: BatchConfig,
    sessions: RwLock<HashMap<String, Arc<Mutex<InstrumentSession>>>>,
}

impl SessionBook {
    pub fn new(gate_config: GateConfig, batch_config: BatchConfig) -> Self {
        Self {
            gate_config,
            batch_config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn session(&self, instrument: &str) -> Arc<Mutex<InstrumentSession>> {
        if let Some(session) = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instrument)
        {
            return session.clone();
        }

        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(instrument.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(InstrumentSession {
                    gate: StabilityGate::new(instrument, self.gate_config),
                    batch: BatchScheduler::new(instrument, self.batch_config.clone()),
                }))
            })
            .clone()
    }

    /// Run `f` on an existing session only; `default` when the instrument is unknown
    fn peek<R>(&self, instrument: &str, default: R, f: impl FnOnce(&InstrumentSession) -> R) -> R {
        let session = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instrument)
            .cloned();
        match session {
            Some(session) => f(&session.lock().unwrap_or_else(PoisonError::into_inner)),
            None => default,
        }
    }

    /// Run `f` with the instrument's session locked
    pub fn with_session<R>(&self, instrument: &str, f: impl FnOnce(&mut InstrumentSession) -> R) -> R {
        let session = self.session(instrument);
        let mut guard: MutexGuard<'_, InstrumentSession> =
            session.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn instruments(&self) -> Vec<String> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn latest_price(&self, instrument: &str) -> Option<f64> {
        self.peek(instrument, None, |s| s.gate.latest_price())
    }

    pub fn update_price(&self, instrument: &str, price: f64) {
        self.update_price_at(instrument, price, Utc::now());
    }

    pub fn update_price_at(&self, instrument: &str, price: f64, at: DateTime<Utc>) {
        self.with_session(instrument, |s| s.gate.update_price_at(price, at));
    }

    pub fn is_accelerated_drop(&self, instrument: &str) -> bool {
        self.is_accelerated_drop_at(instrument, Utc::now())
    }

    pub fn is_accelerated_drop_at(&self, instrument: &str, now: DateTime<Utc>) -> bool {
        self.peek(instrument, false, |s| s.gate.is_accelerated_drop_at(now))
    }

    pub fn register_buy_signal(&self, instrument: &str, limit_price: f64) -> bool {
        self.register_buy_signal_at(instrument, limit_price, Utc::now())
    }

    pub fn register_buy_signal_at(&self, instrument: &str, limit_price: f64, now: DateTime<Utc>) -> bool {
        self.with_session(instrument, |s| s.gate.register_buy_signal_at(limit_price, now))
    }

    pub fn check_stability(&self, instrument: &str) -> StabilityStatus {
        self.check_stability_at(instrument, Utc::now())
    }

    pub fn check_stability_at(&self, instrument: &str, now: DateTime<Utc>) -> StabilityStatus {
        self.with_session(instrument, |s| s.gate.check_stability_at(now))
    }

    pub fn clear_signal(&self, instrument: &str) {
        self.with_session(instrument, |s| s.gate.clear_signal());
    }

    pub fn has_pending_signal(&self, instrument: &str) -> bool {
        self.peek(instrument, false, |s| s.gate.pending().is_some())
    }

    pub fn register_batch(&self, instrument: &str, limit_price: f64) -> bool {
        self.register_batch_at(instrument, limit_price, Utc::now())
    }

    pub fn register_batch_at(&self, instrument: &str, limit_price: f64, now: DateTime<Utc>) -> bool {
        self.with_session(instrument, |s| s.batch.register_buy_signal_at(limit_price, now))
    }

    pub fn get_next_batch(&self, instrument: &str) -> Option<Tranche> {
        self.get_next_batch_at(instrument, Utc::now())
    }

    pub fn get_next_batch_at(&self, instrument: &str, now: DateTime<Utc>) -> Option<Tranche> {
        self.with_session(instrument, |s| s.batch.get_next_batch_at(now))
    }

    pub fn mark_batch_filled(&self, instrument: &str, index: usize) {
        self.mark_batch_filled_at(instrument, index, Utc::now());
    }

    pub fn mark_batch_filled_at(&self, instrument: &str, index: usize, now: DateTime<Utc>) {
        self.with_session(instrument, |s| s.batch.mark_batch_filled_at(index, now));
    }

    pub fn is_batch_active(&self, instrument: &str) -> bool {
        self.peek(instrument, false, |s| s.batch.is_batch_active())
    }

    pub fn get_total_amount(&self, instrument: &str) -> f64 {
        self.peek(instrument, 0.0, |s| s.batch.get_total_amount())
    }

    /// Clear batch state after the position closes
    pub fn reset_crypto(&self, instrument: &str) {
        self.with_session(instrument, |s| s.batch.reset());
    }

    /// Drop every trace of an instrument removed from tracking
    pub fn reset(&self, instrument: &str) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instrument);
    }
}
