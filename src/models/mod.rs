use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exchange instrument identifier (e.g. `BTC-USDT`)
pub type InstrumentId = String;

/// Ledger state marking a closed position
pub const STATE_SOLD_OUT: &str = "sold out";

/// Single observed trade price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

impl PricePoint {
    pub fn new(timestamp: DateTime<Utc>, price: f64) -> Self {
        Self { timestamp, price }
    }
}

/// OHLCV candle as delivered by the exchange
///
/// `timestamp` is the start of the candle's period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub instrument: InstrumentId,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// True once the period has closed
    pub confirmed: bool,
}

/// Last-trade update from the ticker channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub instrument: InstrumentId,
    pub last: f64,
    pub received_at: DateTime<Utc>,
}

/// Order lifecycle as recorded in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Filled,
    PartiallyFilled,
    SoldOut,
    /// Free-text state the core does not interpret
    Other(String),
}

impl OrderState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" | "live" => OrderState::Pending,
            "filled" => OrderState::Filled,
            "partially_filled" => OrderState::PartiallyFilled,
            STATE_SOLD_OUT => OrderState::SoldOut,
            other => OrderState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            OrderState::Pending => "pending",
            OrderState::Filled => "filled",
            OrderState::PartiallyFilled => "partially_filled",
            OrderState::SoldOut => STATE_SOLD_OUT,
            OrderState::Other(s) => s,
        }
    }

    /// Filled or partially filled, i.e. a held position
    pub fn is_held(&self) -> bool {
        matches!(self, OrderState::Filled | OrderState::PartiallyFilled)
    }
}

/// Buy or sell side of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

/// One row of the durable order ledger
///
/// The ledger is authoritative. In-memory mirrors of these rows are
/// repaired by the reconciler, never the other way around.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub instrument: InstrumentId,
    pub order_id: String,
    pub strategy_flag: String,
    /// Epoch milliseconds
    pub create_time: i64,
    pub order_type: String,
    pub side: OrderSide,
    pub state: OrderState,
    pub price: Option<f64>,
    pub size: Option<f64>,
    /// Epoch milliseconds
    pub sell_time: Option<i64>,
    pub sell_price: Option<f64>,
}

impl OrderRecord {
    /// Held and not yet priced out
    pub fn is_open_position(&self) -> bool {
        self.state.is_held() && self.sell_price.is_none()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.create_time)
    }
}
