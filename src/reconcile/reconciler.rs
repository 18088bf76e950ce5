use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::store::{ActiveOrder, StrategyStore};
use crate::db::{LedgerError, OrderLedger};
use crate::models::OrderRecord;

/// Mutations made by one reconciliation pass over one strategy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Active in memory, closed in the ledger
    pub removed: Vec<String>,
    /// Open in the ledger, missing from memory
    pub restored: Vec<String>,
    /// Pending entries with no open order behind them
    pub purged: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.mutations() == 0
    }

    pub fn mutations(&self) -> usize {
        self.removed.len() + self.restored.len() + self.purged.len()
    }
}

/// Repairs every strategy store from the ledger
pub struct StateReconciler<L> {
    ledger: Arc<L>,
    stores: Vec<Arc<StrategyStore>>,
}

impl<L: OrderLedger> StateReconciler<L> {
    pub fn new(ledger: Arc<L>, stores: Vec<Arc<StrategyStore>>) -> Self {
        Self { ledger, stores }
    }

    /// One pass per strategy; a failed strategy does not stop the others
    pub async fn reconcile_once(&self) -> Vec<(String, Result<ReconcileReport, LedgerError>)> {
        let mut results = Vec::with_capacity(self.stores.len());
        for store in &self.stores {
            let result = self.reconcile_strategy(store).await;
            if let Err(e) = &result {
                tracing::error!("❌ [{}] Memory sync failed: {}", store.label(), e);
            }
            results.push((store.flag().to_string(), result));
        }
        results
    }

    pub async fn reconcile_strategy(
        &self,
        store: &StrategyStore,
    ) -> Result<ReconcileReport, LedgerError> {
        let records = self.ledger.open_positions(store.flag()).await?;

        // newest row wins when an instrument has several open orders
        let mut authoritative: HashMap<String, OrderRecord> = HashMap::new();
        for record in records {
            authoritative.entry(record.instrument.clone()).or_insert(record);
        }

        let mut report = ReconcileReport::default();
        let mut state = store.lock();

        let stale: Vec<String> = state
            .active
            .keys()
            .filter(|instrument| !authoritative.contains_key(*instrument))
            .cloned()
            .collect();
        for instrument in stale {
            state.active.remove(&instrument);
            tracing::warn!(
                "🧹 [{}] Cleaned stale memory: {} (closed in ledger but still active)",
                store.label(),
                instrument
            );
            report.removed.push(instrument);
        }

        for (instrument, record) in &authoritative {
            if state.active.contains_key(instrument) {
                continue;
            }
            let Some(buy_time) = record.created_at() else {
                tracing::warn!(
                    "⚠️ [{}] Cannot restore {}: bad create_time {}",
                    store.label(),
                    instrument,
                    record.create_time
                );
                continue;
            };

            state.active.insert(
                instrument.clone(),
                restore_order(store, record, buy_time),
            );
            tracing::warn!(
                "🔄 [{}] Restored missing memory: {}, order_id={} (open in ledger)",
                store.label(),
                instrument,
                record.order_id
            );
            report.restored.push(instrument.clone());
        }

        let orphaned: Vec<String> = state
            .pending
            .keys()
            .filter(|i| !authoritative.contains_key(*i) && !state.active.contains_key(*i))
            .cloned()
            .collect();
        for instrument in orphaned {
            state.pending.remove(&instrument);
            tracing::warn!("🧹 [{}] Cleaned stale pending buy: {}", store.label(), instrument);
            report.purged.push(instrument);
        }

        if report.is_empty() {
            tracing::info!(
                "✅ [{}] Memory in sync: {} active, {} pending",
                store.label(),
                state.active.len(),
                state.pending.len()
            );
        }

        report.removed.sort();
        report.restored.sort();
        report.purged.sort();
        Ok(report)
    }

    /// Reconcile now, then every `period` until shutdown
    pub async fn run(&self, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!("🔄 Running startup memory sync...");
        self.reconcile_once().await;

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::info!("🔄 Running periodic memory sync...");
                    self.reconcile_once().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Reconciler stopped");
                    break;
                }
            }
        }
    }
}

fn restore_order(store: &StrategyStore, record: &OrderRecord, buy_time: DateTime<Utc>) -> ActiveOrder {
    ActiveOrder {
        order_id: record.order_id.clone(),
        buy_price: record.price.unwrap_or(0.0),
        size: record.size,
        buy_time,
        next_decision_time: store.next_decision_time(buy_time),
        sell_triggered: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyConfig;
    use crate::db::MemoryLedger;
    use crate::models::{OrderSide, OrderState};
    use crate::reconcile::store::PendingBuy;
    use chrono::TimeZone;

    const FLAG: &str = "stable_buy_ws";

    fn filled(instrument: &str, order_id: &str, create: DateTime<Utc>) -> OrderRecord {
        OrderRecord {
            instrument: instrument.to_string(),
            order_id: order_id.to_string(),
            strategy_flag: FLAG.to_string(),
            create_time: create.timestamp_millis(),
            order_type: "limit".to_string(),
            side: OrderSide::Buy,
            state: OrderState::Filled,
            price: Some(2.5),
            size: Some(12.0),
            sell_time: None,
            sell_price: None,
        }
    }

    fn setup() -> (Arc<MemoryLedger>, Arc<StrategyStore>, StateReconciler<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        let store = Arc::new(StrategyStore::new(StrategyConfig::new(FLAG, "stable")));
        let reconciler = StateReconciler::new(ledger.clone(), vec![store.clone()]);
        (ledger, store, reconciler)
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 20, 0).unwrap()
    }

    #[tokio::test]
    async fn test_restores_missing_entry_from_ledger() {
        let (ledger, store, reconciler) = setup();
        ledger.insert_order(&filled("ADA-USDT", "42", noon())).await.unwrap();

        let report = reconciler.reconcile_strategy(&store).await.unwrap();

        assert_eq!(report.restored, vec!["ADA-USDT".to_string()]);
        let order = store.active("ADA-USDT").unwrap();
        assert_eq!(order.order_id, "42");
        assert_eq!(order.buy_price, 2.5);
        assert_eq!(order.buy_time, noon());
        assert_eq!(
            order.next_decision_time,
            Utc.with_ymd_and_hms(2024, 3, 1, 13, 55, 0).unwrap()
        );
        assert_eq!(store.active_count(), 1);
    }

    #[tokio::test]
    async fn test_second_pass_makes_no_mutations() {
        let (ledger, store, reconciler) = setup();
        ledger.insert_order(&filled("ADA-USDT", "42", noon())).await.unwrap();
        store.record_fill("XRP-USDT", "7", 0.5, 10.0, noon());
        store.add_pending("DOT-USDT", 6.0, noon());

        let first = reconciler.reconcile_strategy(&store).await.unwrap();
        assert_eq!(first.removed, vec!["XRP-USDT".to_string()]);
        assert_eq!(first.restored, vec!["ADA-USDT".to_string()]);
        assert_eq!(first.purged, vec!["DOT-USDT".to_string()]);

        let second = reconciler.reconcile_strategy(&store).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_newest_open_order_wins() {
        let (ledger, store, reconciler) = setup();
        ledger.insert_order(&filled("ADA-USDT", "old", noon())).await.unwrap();
        ledger
            .insert_order(&filled("ADA-USDT", "new", noon() + chrono::Duration::minutes(10)))
            .await
            .unwrap();

        reconciler.reconcile_strategy(&store).await.unwrap();
        assert_eq!(store.active("ADA-USDT").unwrap().order_id, "new");
    }

    #[tokio::test]
    async fn test_pending_kept_while_position_is_open() {
        let (ledger, store, reconciler) = setup();
        ledger.insert_order(&filled("ADA-USDT", "42", noon())).await.unwrap();
        store.lock().pending.insert(
            "ADA-USDT".to_string(),
            PendingBuy {
                since: noon(),
                limit_price: 2.4,
            },
        );

        let report = reconciler.reconcile_strategy(&store).await.unwrap();
        assert!(report.purged.is_empty());
        assert!(store.is_pending("ADA-USDT"));
    }

    #[tokio::test]
    async fn test_unavailable_ledger_aborts_only_that_pass() {
        let (ledger, store, reconciler) = setup();
        store.record_fill("XRP-USDT", "7", 0.5, 10.0, noon());
        ledger.set_available(false);

        let results = reconciler.reconcile_once().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_err());
        assert!(store.active("XRP-USDT").is_some());

        ledger.set_available(true);
        let results = reconciler.reconcile_once().await;
        assert_eq!(
            results[0].1.as_ref().unwrap().removed,
            vec!["XRP-USDT".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_passes_until_shutdown() {
        let (ledger, store, reconciler) = setup();
        let reconciler = Arc::new(reconciler);
        let (tx, rx) = broadcast::channel(1);

        let handle = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.run(Duration::from_secs(300), rx).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        ledger.insert_order(&filled("ADA-USDT", "42", noon())).await.unwrap();
        assert!(store.active("ADA-USDT").is_none());

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(store.active("ADA-USDT").is_some());

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
