use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{LedgerError, OrderLedger};
use crate::models::{OrderRecord, OrderState};

/// In-process ledger with the same contract as Postgres
///
/// Used by tests and as the fallback when no database is reachable.
/// `set_available(false)` makes every call fail, to exercise outage paths.
#[derive(Debug)]
pub struct MemoryLedger {
    records: Mutex<Vec<OrderRecord>>,
    available: AtomicBool,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Snapshot of every row, in insertion order
    pub fn records(&self) -> Vec<OrderRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<OrderRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LedgerError::Unavailable("memory ledger switched off".to_string()))
        }
    }
}

impl OrderLedger for MemoryLedger {
    async fn open_positions(&self, strategy_flag: &str) -> Result<Vec<OrderRecord>, LedgerError> {
        self.check_available()?;

        let mut open: Vec<OrderRecord> = self
            .lock()
            .iter()
            .filter(|r| r.strategy_flag == strategy_flag && r.is_open_position())
            .cloned()
            .collect();
        open.sort_by(|a, b| b.create_time.cmp(&a.create_time));
        Ok(open)
    }

    async fn insert_order(&self, record: &OrderRecord) -> Result<(), LedgerError> {
        self.check_available()?;

        let mut records = self.lock();
        let duplicate = records.iter().any(|r| {
            r.instrument == record.instrument
                && r.order_id == record.order_id
                && r.strategy_flag == record.strategy_flag
        });
        if duplicate {
            return Err(LedgerError::Malformed(format!(
                "duplicate order {} for {}",
                record.order_id, record.instrument
            )));
        }
        records.push(record.clone());
        Ok(())
    }

    async fn mark_sold(
        &self,
        instrument: &str,
        order_id: &str,
        strategy_flag: &str,
        sell_price: f64,
        sell_time: i64,
    ) -> Result<bool, LedgerError> {
        self.check_available()?;

        let mut records = self.lock();
        let Some(record) = records.iter_mut().find(|r| {
            r.instrument == instrument && r.order_id == order_id && r.strategy_flag == strategy_flag
        }) else {
            return Ok(false);
        };

        record.state = OrderState::SoldOut;
        record.sell_price = Some(sell_price);
        record.sell_time = Some(sell_time);
        Ok(true)
    }
}
