// Ledger-to-memory drift repair
pub mod reconciler;
pub mod store;

pub use reconciler::{ReconcileReport, StateReconciler};
pub use store::{ActiveOrder, PendingBuy, StrategyStore};
