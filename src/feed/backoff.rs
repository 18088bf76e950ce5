use std::time::Duration;

use crate::config::FeedConfig;

/// Exponential reconnect delay with a stability reset
///
/// Each consecutive failure multiplies the delay by `multiplier`, up to
/// `max`. A connection that stayed up for at least `min_stable` before
/// failing starts the sequence over from `initial`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    min_stable: Duration,
    current: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, min_stable: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
            min_stable,
            current: initial.min(max),
        }
    }

    pub fn from_config(config: &FeedConfig) -> Self {
        Self::new(
            config.initial_delay(),
            config.max_delay(),
            config.multiplier,
            config.min_stable(),
        )
    }

    /// Delay to wait after a failed connection
    ///
    /// `uptime` is how long the connection was open before it failed, or
    /// `None` if it never opened.
    pub fn next_delay(&mut self, uptime: Option<Duration>) -> Duration {
        if uptime.is_some_and(|up| up >= self.min_stable) {
            self.reset();
        }

        let delay = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }

    /// Delay the next failure would produce (without advancing)
    pub fn peek(&self) -> Duration {
        self.current
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&FeedConfig::default())
    }
}
