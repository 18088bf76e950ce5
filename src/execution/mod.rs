// Decision loop and order execution
pub mod engine;
pub mod paper;

pub use engine::{DecisionEngine, FeedForwarder};
pub use paper::PaperExecutor;

/// One tranche the engine wants bought
#[derive(Debug, Clone, PartialEq)]
pub struct BuyIntent {
    pub instrument: String,
    pub tranche: usize,
    /// Quote-currency notional
    pub amount: f64,
    pub limit_price: f64,
}

/// A held position whose scheduled exit is due
#[derive(Debug, Clone, PartialEq)]
pub struct SellIntent {
    pub instrument: String,
    pub order_id: String,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TradeIntent {
    Buy(BuyIntent),
    Sell(SellIntent),
}
