pub mod batch;
pub mod history;
pub mod session;
pub mod stability;

pub use batch::{BatchScheduler, BatchState, Tranche};
pub use history::PriceHistory;
pub use session::{InstrumentSession, SessionBook};
pub use stability::{dynamic_threshold, PendingSignal, StabilityGate, StabilityStatus};
