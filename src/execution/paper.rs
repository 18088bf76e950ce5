use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::{BuyIntent, SellIntent};
use crate::db::OrderLedger;
use crate::gate::SessionBook;
use crate::models::{OrderRecord, OrderSide, OrderState};
use crate::reconcile::StrategyStore;
use crate::Result;

/// Dry-run executor: every order fills at its limit price
///
/// Fills are still written to the ledger so restarts and reconciliation
/// behave exactly as they would live.
pub struct PaperExecutor<L> {
    ledger: Arc<L>,
    store: Arc<StrategyStore>,
    sessions: Arc<SessionBook>,
}

impl<L: OrderLedger> PaperExecutor<L> {
    pub fn new(ledger: Arc<L>, store: Arc<StrategyStore>, sessions: Arc<SessionBook>) -> Self {
        Self {
            ledger,
            store,
            sessions,
        }
    }

    pub async fn buy(&self, intent: &BuyIntent, now: DateTime<Utc>) -> Result<OrderRecord> {
        if intent.limit_price <= 0.0 {
            return Err(format!("invalid limit price {} for {}", intent.limit_price, intent.instrument).into());
        }
        let size = intent.amount / intent.limit_price;

        tracing::info!(
            "  → Would BUY {:.6} {} @ ${:.6} (tranche {}, total: ${:.2})",
            size,
            intent.instrument,
            intent.limit_price,
            intent.tranche + 1,
            intent.amount
        );

        let record = OrderRecord {
            instrument: intent.instrument.clone(),
            order_id: format!("paper-{}", Uuid::new_v4()),
            strategy_flag: self.store.flag().to_string(),
            create_time: now.timestamp_millis(),
            order_type: "limit".to_string(),
            side: OrderSide::Buy,
            state: OrderState::Filled,
            price: Some(intent.limit_price),
            size: Some(size),
            sell_time: None,
            sell_price: None,
        };
        self.ledger.insert_order(&record).await?;

        self.sessions
            .mark_batch_filled_at(&intent.instrument, intent.tranche, now);
        self.store.record_fill(
            &intent.instrument,
            &record.order_id,
            intent.limit_price,
            size,
            now,
        );

        tracing::info!("  ✓ Recorded fill {} for {}", record.order_id, intent.instrument);
        Ok(record)
    }

    /// Close every open ledger row of the instrument and clear its state
    pub async fn sell(&self, intent: &SellIntent, now: DateTime<Utc>) -> Result<usize> {
        tracing::info!(
            "  → Would SELL {} @ ${:.6} (order {})",
            intent.instrument,
            intent.price,
            intent.order_id
        );

        let open = self.ledger.open_positions(self.store.flag()).await?;
        let mut closed = 0;
        for record in open.iter().filter(|r| r.instrument == intent.instrument) {
            if self
                .ledger
                .mark_sold(
                    &record.instrument,
                    &record.order_id,
                    &record.strategy_flag,
                    intent.price,
                    now.timestamp_millis(),
                )
                .await?
            {
                closed += 1;
            }
        }

        self.store.remove_active(&intent.instrument);
        self.sessions.reset_crypto(&intent.instrument);
        self.sessions.clear_signal(&intent.instrument);

        tracing::info!("  ✓ Closed {} orders for {}", closed, intent.instrument);
        Ok(closed)
    }
}
