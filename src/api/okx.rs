use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::CandleSource;
use crate::config::ReferenceConfig;
use crate::feed::messages::parse_candle_row;
use crate::models::Candle;

/// Success sentinel in the `code` field of every response
const SUCCESS_CODE: &str = "0";

type MarketRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Exchange returned code {code}: {msg}")]
    Status { code: String, msg: String },

    #[error("Malformed candle: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<Value>,
}

/// Request/response client for exchange market data
///
/// Cloneable; all clones share one rate limiter.
#[derive(Clone)]
pub struct OkxMarketClient {
    client: Client,
    base_url: String,
    rate_limiter: Arc<MarketRateLimiter>,
}

impl OkxMarketClient {
    pub fn new(config: &ReferenceConfig) -> Result<Self, MarketDataError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        Ok(Self {
            client,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            rate_limiter,
        })
    }

    /// Fetch the newest `limit` candles, newest first
    pub async fn get_candles(
        &self,
        instrument: &str,
        bar: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, MarketDataError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/api/v5/market/candles", self.base_url);
        let limit = limit.to_string();
        let response: ApiResponse = self
            .client
            .get(&url)
            .query(&[("instId", instrument), ("bar", bar), ("limit", limit.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.code != SUCCESS_CODE {
            return Err(MarketDataError::Status {
                code: response.code,
                msg: response.msg,
            });
        }

        response
            .data
            .iter()
            .map(|row| parse_candle_row(instrument, row).map_err(MarketDataError::Malformed))
            .collect()
    }
}

impl CandleSource for OkxMarketClient {
    async fn recent_candles(
        &self,
        instrument: &str,
        bar: &str,
        limit: usize,
    ) -> crate::Result<Vec<Candle>> {
        Ok(self.get_candles(instrument, bar, limit).await?)
    }
}
