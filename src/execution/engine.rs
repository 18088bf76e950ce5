use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};

use super::{BuyIntent, PaperExecutor, SellIntent, TradeIntent};
use crate::api::CandleSource;
use crate::db::OrderLedger;
use crate::feed::{parse_message, FeedEvent, FeedHandler, SubscriptionArg};
use crate::gate::{SessionBook, StabilityStatus};
use crate::models::{Candle, Ticker};
use crate::pricing::{limit_price, ReferencePriceCache};
use crate::reconcile::StrategyStore;

/// How often pending signals and batches are polled
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Forwards decoded frames from a feed connection to the engine
pub struct FeedForwarder {
    subscriptions: Vec<SubscriptionArg>,
    events: mpsc::Sender<FeedEvent>,
}

impl FeedForwarder {
    pub fn new(subscriptions: Vec<SubscriptionArg>, events: mpsc::Sender<FeedEvent>) -> Self {
        Self {
            subscriptions,
            events,
        }
    }
}

impl FeedHandler for FeedForwarder {
    fn subscriptions(&self) -> Vec<SubscriptionArg> {
        self.subscriptions.clone()
    }

    fn on_message(&self, text: &str) {
        match parse_message(text, Utc::now()) {
            Ok(events) => {
                for event in events {
                    if let Err(e) = self.events.try_send(event) {
                        tracing::warn!("Dropping feed event: {}", e);
                    }
                }
            }
            Err(e) => tracing::debug!("Ignoring feed message ({}): {:.200}", e, text),
        }
    }
}

/// Turns feed events into gated, batched buys and scheduled exits
///
/// Ticks update price history and may register a buy signal; a 1 Hz poll
/// advances stability checks and emits tranches and sells when due.
pub struct DecisionEngine<S, L> {
    sessions: Arc<SessionBook>,
    references: Arc<ReferencePriceCache<S>>,
    store: Arc<StrategyStore>,
    executor: PaperExecutor<L>,
    /// instrument -> limit percent of the reference price
    limits: BTreeMap<String, f64>,
    gain_threshold_pct: f64,
    last_prices: HashMap<String, f64>,
}

impl<S: CandleSource, L: OrderLedger> DecisionEngine<S, L> {
    pub fn new(
        sessions: Arc<SessionBook>,
        references: Arc<ReferencePriceCache<S>>,
        store: Arc<StrategyStore>,
        executor: PaperExecutor<L>,
        limits: BTreeMap<String, f64>,
        gain_threshold_pct: f64,
    ) -> Self {
        Self {
            sessions,
            references,
            store,
            executor,
            limits,
            gain_threshold_pct,
            last_prices: HashMap::new(),
        }
    }

    pub async fn handle_event(&mut self, event: FeedEvent, now: DateTime<Utc>) {
        match event {
            FeedEvent::Ticker(ticker) => {
                self.on_ticker(&ticker).await;
            }
            FeedEvent::Candle(candle) => {
                self.on_candle(&candle, now);
            }
            FeedEvent::Subscribed { channel, inst_id } => {
                tracing::debug!("Subscribed: {} {}", channel, inst_id);
            }
            FeedEvent::Error { code, message } => {
                tracing::warn!("⚠️ Feed error {}: {}", code, message);
            }
            FeedEvent::Pong => {}
        }
    }

    /// Returns true when a buy signal was registered
    pub async fn on_ticker(&mut self, ticker: &Ticker) -> bool {
        let instrument = ticker.instrument.as_str();
        let now = ticker.received_at;

        self.sessions.update_price_at(instrument, ticker.last, now);
        self.references.note_activity(instrument);

        if self.last_prices.insert(instrument.to_string(), ticker.last) == Some(ticker.last) {
            return false;
        }

        let Some(&limit_percent) = self.limits.get(instrument) else {
            return false;
        };

        if self.store.has_entry(instrument)
            || self.sessions.has_pending_signal(instrument)
            || self.sessions.is_batch_active(instrument)
        {
            return false;
        }

        let Some(reference) = self.references.refresh_if_due_at(instrument, now).await else {
            return false;
        };

        let limit = limit_price(reference, limit_percent);
        if ticker.last > limit {
            return false;
        }

        let gain = self
            .references
            .check_gain_filter_at(instrument, reference, self.gain_threshold_pct, now)
            .await;
        if gain.should_skip {
            tracing::info!(
                instrument,
                "⏭️ Skipping buy: up {:.2}% over lookback (threshold {:.2}%)",
                gain.gain_pct.unwrap_or_default(),
                self.gain_threshold_pct
            );
            return false;
        }

        tracing::info!(
            instrument,
            "🎯 Price ${:.6} at or below limit ${:.6} (ref ${:.6}, {}%)",
            ticker.last,
            limit,
            reference,
            limit_percent
        );

        if !self.sessions.register_buy_signal_at(instrument, limit, now) {
            return false;
        }
        self.store.add_pending(instrument, limit, now);
        true
    }

    pub fn on_candle(&self, candle: &Candle, now: DateTime<Utc>) -> bool {
        self.references.apply_candle_at(candle, now)
    }

    /// Advance every instrument one decision cycle
    pub fn poll_at(&self, now: DateTime<Utc>) -> Vec<TradeIntent> {
        let mut intents = Vec::new();

        for (instrument, order) in self.store.take_due_sells(now) {
            match self.sessions.latest_price(&instrument) {
                Some(price) => intents.push(TradeIntent::Sell(SellIntent {
                    instrument,
                    order_id: order.order_id,
                    price,
                })),
                None => {
                    tracing::debug!(instrument = %instrument, "⏳ Sell due but no price yet");
                    self.store.clear_sell_trigger(&instrument);
                }
            }
        }

        for instrument in self.sessions.instruments() {
            if self
                .store
                .active(&instrument)
                .is_some_and(|o| o.sell_triggered)
            {
                continue;
            }

            let tranche = self.sessions.with_session(&instrument, |s| {
                if let StabilityStatus::Ready { price } = s.gate.check_stability_at(now) {
                    // a finished batch still held here belongs to a position closed elsewhere
                    if !s.batch.is_batch_active() {
                        s.batch.reset();
                    }
                    s.batch.register_buy_signal_at(price, now);
                }
                s.batch.get_next_batch_at(now)
            });

            if let Some(tranche) = tranche {
                intents.push(TradeIntent::Buy(BuyIntent {
                    instrument,
                    tranche: tranche.index,
                    amount: tranche.amount,
                    limit_price: tranche.limit_price,
                }));
            }
        }

        intents
    }

    /// Hand intents to the executor; failures are retried on a later poll
    pub async fn execute(&self, intents: Vec<TradeIntent>, now: DateTime<Utc>) {
        for intent in intents {
            match intent {
                TradeIntent::Buy(buy) => {
                    if let Err(e) = self.executor.buy(&buy, now).await {
                        tracing::error!(instrument = %buy.instrument, "  ✗ Buy failed: {}", e);
                    }
                }
                TradeIntent::Sell(sell) => {
                    if let Err(e) = self.executor.sell(&sell, now).await {
                        tracing::error!(instrument = %sell.instrument, "  ✗ Sell failed: {}", e);
                        self.store.clear_sell_trigger(&sell.instrument);
                    }
                }
            }
        }
    }

    /// Consume feed events and poll until shutdown or the feeds go away
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<FeedEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            "🚀 Decision engine started: {} instruments, strategy {}",
            self.limits.len(),
            self.store.flag()
        );

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, Utc::now()).await,
                    None => {
                        tracing::warn!("Feed channel closed, stopping engine");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let intents = self.poll_at(now);
                    self.execute(intents, now).await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Decision engine stopped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchConfig, GateConfig, ReferenceConfig, StrategyConfig};
    use crate::db::MemoryLedger;
    use chrono::{Duration as ChronoDuration, TimeZone};

    struct FixedCandles(Vec<Candle>);

    impl CandleSource for FixedCandles {
        async fn recent_candles(
            &self,
            _instrument: &str,
            _bar: &str,
            limit: usize,
        ) -> crate::Result<Vec<Candle>> {
            Ok(self.0.iter().take(limit).cloned().collect())
        }
    }

    const INST: &str = "SOL-USDT";

    fn t(s: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 20, 0).unwrap() + ChronoDuration::seconds(s)
    }

    fn candle(hour: u32, open: f64, close: f64) -> Candle {
        Candle {
            instrument: INST.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap(),
            open,
            high: open,
            low: close,
            close,
            volume: 1.0,
            confirmed: hour < 12,
        }
    }

    fn ticker(s: i64, last: f64) -> Ticker {
        Ticker {
            instrument: INST.to_string(),
            last,
            received_at: t(s),
        }
    }

    struct Harness {
        ledger: Arc<MemoryLedger>,
        store: Arc<StrategyStore>,
        engine: DecisionEngine<FixedCandles, MemoryLedger>,
    }

    /// Reference open 100, limit 98%; two periods ago closed at `close_two_ago`
    fn harness(close_two_ago: f64) -> Harness {
        let candles = vec![
            candle(12, 100.0, 99.0),
            candle(11, 99.0, 100.0),
            candle(10, 98.0, close_two_ago),
        ];
        let ledger = Arc::new(MemoryLedger::new());
        let store = Arc::new(StrategyStore::new(StrategyConfig::new("batch_buy_ws", "batch")));
        let sessions = Arc::new(SessionBook::new(GateConfig::default(), BatchConfig::default()));
        let references = Arc::new(ReferencePriceCache::new(
            FixedCandles(candles),
            ReferenceConfig::default(),
        ));
        let executor = PaperExecutor::new(ledger.clone(), store.clone(), sessions.clone());
        let limits = BTreeMap::from([(INST.to_string(), 98.0)]);
        let engine = DecisionEngine::new(sessions, references, store.clone(), executor, limits, 5.0);
        Harness {
            ledger,
            store,
            engine,
        }
    }

    #[tokio::test]
    async fn test_tick_below_limit_registers_signal() {
        let mut h = harness(97.0);

        assert!(!h.engine.on_ticker(&ticker(0, 99.0)).await);
        assert!(h.engine.on_ticker(&ticker(1, 97.9)).await);
        assert!(h.store.is_pending(INST));

        // already pending: no second signal
        assert!(!h.engine.on_ticker(&ticker(2, 97.5)).await);
    }

    #[tokio::test]
    async fn test_gain_filter_blocks_after_run_up() {
        // 100 vs 94: +6.4% over two periods
        let mut h = harness(94.0);

        assert!(!h.engine.on_ticker(&ticker(0, 97.0)).await);
        assert!(!h.store.has_entry(INST));
    }

    #[tokio::test]
    async fn test_unchanged_price_is_not_re_evaluated() {
        let mut h = harness(97.0);
        h.engine.on_ticker(&ticker(0, 99.0)).await;
        h.engine.limits.insert(INST.to_string(), 100.0);

        assert!(!h.engine.on_ticker(&ticker(1, 99.0)).await);
        assert!(h.engine.on_ticker(&ticker(2, 99.5)).await);
    }

    #[tokio::test]
    async fn test_untracked_instrument_only_feeds_history() {
        let mut h = harness(97.0);
        let other = Ticker {
            instrument: "DOGE-USDT".to_string(),
            last: 0.1,
            received_at: t(0),
        };

        assert!(!h.engine.on_ticker(&other).await);
        assert_eq!(
            h.engine.sessions.with_session("DOGE-USDT", |s| s.gate.latest_price()),
            Some(0.1)
        );
    }

    #[tokio::test]
    async fn test_stable_signal_emits_first_tranche_then_waits() {
        let mut h = harness(97.0);
        for s in 0..=5 {
            h.engine.on_ticker(&ticker(s, 97.5 + 0.0001 * s as f64)).await;
        }
        assert!(h.store.is_pending(INST));

        let mut buys = Vec::new();
        for s in 6..=16 {
            h.engine.on_ticker(&ticker(s, 97.5)).await;
            let intents = h.engine.poll_at(t(s));
            buys.extend(intents.clone());
            h.engine.execute(intents, t(s)).await;
        }

        assert_eq!(buys.len(), 1);
        let TradeIntent::Buy(first) = &buys[0] else {
            panic!("expected a buy");
        };
        assert_eq!(first.tranche, 0);
        assert_eq!(first.amount, 30.0);
        assert!(first.limit_price <= 98.0);

        assert_eq!(h.ledger.records().len(), 1);
        assert!(!h.store.is_pending(INST));
        assert!(h.engine.poll_at(t(17)).is_empty());

        let later = h.engine.poll_at(t(16 + 600));
        assert!(matches!(&later[..], [TradeIntent::Buy(b)] if b.tranche == 1));
    }

    #[tokio::test]
    async fn test_due_position_is_sold_and_reset() {
        let h = harness(97.0);
        h.engine.sessions.update_price_at(INST, 101.0, t(0));
        h.store.record_fill(INST, "paper-1", 97.0, 1.0, t(0));

        assert!(h.engine.poll_at(t(60)).is_empty());

        // 12:20 buy -> 13:55 exit
        let exit = Utc.with_ymd_and_hms(2024, 3, 1, 13, 55, 0).unwrap();
        let intents = h.engine.poll_at(exit);
        assert_eq!(
            intents,
            vec![TradeIntent::Sell(SellIntent {
                instrument: INST.to_string(),
                order_id: "paper-1".to_string(),
                price: 101.0,
            })]
        );

        h.engine.execute(intents, exit).await;
        assert!(h.store.active(INST).is_none());
    }

    #[tokio::test]
    async fn test_forwarder_parses_and_forwards() {
        let (tx, mut rx) = mpsc::channel(8);
        let forwarder = FeedForwarder::new(vec![SubscriptionArg::new("tickers", INST)], tx);

        forwarder.on_message(
            r#"{"arg":{"channel":"tickers","instId":"SOL-USDT"},"data":[{"instId":"SOL-USDT","last":"142.5"}]}"#,
        );
        forwarder.on_message("not json");
        forwarder.on_message("pong");

        match rx.recv().await.unwrap() {
            FeedEvent::Ticker(t) => assert_eq!(t.last, 142.5),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rx.recv().await.unwrap(), FeedEvent::Pong);
        assert_eq!(forwarder.subscriptions().len(), 1);
    }
}
