// Durable order ledger
pub mod memory;
pub mod postgres;

use std::future::Future;
use thiserror::Error;

use crate::models::OrderRecord;

pub use memory::MemoryLedger;
pub use postgres::PostgresLedger;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("malformed ledger row: {0}")]
    Malformed(String),
}

/// Authoritative store of orders placed by every strategy
///
/// In-memory strategy state is repaired from this, never the reverse.
pub trait OrderLedger: Send + Sync {
    /// Held, not yet priced-out orders for one strategy, newest first
    fn open_positions(
        &self,
        strategy_flag: &str,
    ) -> impl Future<Output = Result<Vec<OrderRecord>, LedgerError>> + Send;

    fn insert_order(
        &self,
        record: &OrderRecord,
    ) -> impl Future<Output = Result<(), LedgerError>> + Send;

    /// Record the exit of an order; false if no such order exists
    fn mark_sold(
        &self,
        instrument: &str,
        order_id: &str,
        strategy_flag: &str,
        sell_price: f64,
        sell_time: i64,
    ) -> impl Future<Output = Result<bool, LedgerError>> + Send;
}
