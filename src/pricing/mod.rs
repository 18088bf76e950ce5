// Reference prices and buy-limit derivation
pub mod reference;

pub use reference::{GainCheck, ReferenceEntry, ReferencePriceCache};

/// Buy limit as a percentage of the reference price
pub fn limit_price(reference: f64, limit_percent: f64) -> f64 {
    reference * (limit_percent / 100.0)
}
