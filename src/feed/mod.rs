// Push-feed connection supervision
pub mod backoff;
pub mod connection;
pub mod messages;

pub use backoff::BackoffPolicy;
pub use connection::{FeedConnectionManager, FeedError, FeedHandler};
pub use messages::{parse_message, subscribe_batches, FeedEvent, SubscriptionArg};
