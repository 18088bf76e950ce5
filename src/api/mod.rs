use std::future::Future;

use crate::models::Candle;

pub mod okx;

pub use okx::{MarketDataError, OkxMarketClient};

/// Source of historical candles for reference prices
pub trait CandleSource: Send + Sync {
    /// Newest `limit` candles of width `bar`, newest first
    fn recent_candles(
        &self,
        instrument: &str,
        bar: &str,
        limit: usize,
    ) -> impl Future<Output = crate::Result<Vec<Candle>>> + Send;
}
