use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use limitbot::api::OkxMarketClient;
use limitbot::config::{Settings, StrategyConfig};
use limitbot::db::{MemoryLedger, OrderLedger, PostgresLedger};
use limitbot::execution::{DecisionEngine, FeedForwarder, PaperExecutor};
use limitbot::feed::{FeedConnectionManager, FeedEvent, SubscriptionArg};
use limitbot::gate::SessionBook;
use limitbot::pricing::ReferencePriceCache;
use limitbot::reconcile::{StateReconciler, StrategyStore};

/// Strategy whose orders the decision engine places
const ENGINE_STRATEGY: &str = "batch_buy_ws";
const EVENT_BUFFER: usize = 10_000;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "limitbot")]
#[command(about = "Gated limit-buy trading core with ledger reconciliation")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "limitbot.toml")]
    config: String,

    /// Paper trade: log orders and write fills to the ledger only
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let settings = Settings::load(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config))?;

    tracing::info!("🚀 limitbot starting");
    tracing::info!(
        "Tracking {} instruments across {} strategies",
        settings.instruments.len(),
        settings.strategies.len()
    );
    if !args.dry_run {
        tracing::warn!("Live order placement is not available, running in paper mode");
    }

    match PostgresLedger::connect(&settings.database).await {
        Ok(ledger) => {
            tracing::info!("Postgres order ledger enabled");
            run(settings, Arc::new(ledger)).await
        }
        Err(e) => {
            tracing::warn!(
                "Failed to connect to Postgres ({}), continuing with in-memory ledger",
                e
            );
            run(settings, Arc::new(MemoryLedger::new())).await
        }
    }
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("limitbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run<L: OrderLedger + 'static>(settings: Settings, ledger: Arc<L>) -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let stores: Vec<Arc<StrategyStore>> = settings
        .strategies
        .iter()
        .cloned()
        .map(|config| Arc::new(StrategyStore::new(config)))
        .collect();
    let engine_store = stores
        .iter()
        .find(|s| s.flag() == ENGINE_STRATEGY)
        .or_else(|| stores.first())
        .cloned()
        .unwrap_or_else(|| Arc::new(StrategyStore::new(StrategyConfig::new(ENGINE_STRATEGY, "batch"))));

    let client = OkxMarketClient::new(&settings.reference).context("failed to build market data client")?;
    let references = Arc::new(ReferencePriceCache::new(client, settings.reference.clone()));
    let instruments: Vec<String> = settings.instruments.keys().cloned().collect();
    references.initialize(&instruments).await;

    let sessions = Arc::new(SessionBook::new(settings.gate, settings.batch.clone()));

    let reconciler = StateReconciler::new(ledger.clone(), stores);
    let reconcile_handle = {
        let period = Duration::from_secs(settings.reconcile.interval_secs.max(1));
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { reconciler.run(period, shutdown).await })
    };

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let ticker_handle = spawn_feed(
        FeedConnectionManager::new("tickers", &settings.feed.ticker_url, settings.feed.clone()),
        subscriptions(&instruments, "tickers"),
        events_tx.clone(),
        shutdown_tx.subscribe(),
    );
    let candle_channel = format!("candle{}", settings.reference.bar);
    let candle_handle = spawn_feed(
        FeedConnectionManager::new("candles", &settings.feed.candle_url, settings.feed.clone()),
        subscriptions(&instruments, &candle_channel),
        events_tx,
        shutdown_tx.subscribe(),
    );

    let executor = PaperExecutor::new(ledger, engine_store.clone(), sessions.clone());
    let engine = DecisionEngine::new(
        sessions,
        references,
        engine_store,
        executor,
        settings.instruments.clone(),
        settings.reference.gain_threshold_pct,
    );
    let engine_handle = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(engine.run(events_rx, shutdown))
    };

    tracing::info!("All tasks running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;

    tracing::info!("Initiating graceful shutdown...");
    let _ = shutdown_tx.send(());

    tokio::select! {
        _ = async {
            let _ = ticker_handle.await;
            let _ = candle_handle.await;
            let _ = reconcile_handle.await;
            let _ = engine_handle.await;
        } => {
            tracing::info!("All tasks completed");
        }
        _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
            tracing::warn!("Shutdown timeout exceeded, forcing exit");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn subscriptions(instruments: &[String], channel: &str) -> Vec<SubscriptionArg> {
    instruments
        .iter()
        .map(|instrument| SubscriptionArg::new(channel, instrument))
        .collect()
}

fn spawn_feed(
    manager: FeedConnectionManager,
    subscriptions: Vec<SubscriptionArg>,
    events: mpsc::Sender<FeedEvent>,
    shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let handler = Arc::new(FeedForwarder::new(subscriptions, events));
    tokio::spawn(async move { manager.run(handler, shutdown).await })
}
