use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

use crate::models::PricePoint;

/// Rolling window of recent prices for one instrument
///
/// Points are kept in arrival order; anything older than the window
/// (relative to the newest point) is pruned on each push.
#[derive(Debug, Clone)]
pub struct PriceHistory {
    points: VecDeque<PricePoint>,
    window: Duration,
}

impl PriceHistory {
    pub fn new(window_secs: f64) -> Self {
        Self {
            points: VecDeque::new(),
            window: secs(window_secs),
        }
    }

    pub fn push(&mut self, point: PricePoint) {
        self.points.push_back(point);

        let cutoff = point.timestamp - self.window;
        while self.points.front().is_some_and(|p| p.timestamp < cutoff) {
            self.points.pop_front();
        }
    }

    pub fn latest(&self) -> Option<PricePoint> {
        self.points.back().copied()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Newest price at or before `target`, else the oldest price held
    pub fn price_at_or_before(&self, target: DateTime<Utc>) -> Option<f64> {
        self.points
            .iter()
            .rev()
            .find(|p| p.timestamp <= target)
            .or_else(|| self.points.front())
            .map(|p| p.price)
    }

    /// Fractional return of the latest price over the trailing `seconds`
    pub fn trailing_return(&self, now: DateTime<Utc>, seconds: f64) -> Option<f64> {
        if self.points.len() < 2 {
            return None;
        }

        let current = self.latest()?.price;
        let past = self.price_at_or_before(now - secs(seconds))?;
        (past > 0.0).then(|| (current - past) / past)
    }

    /// Sample standard deviation of consecutive returns in the trailing window
    ///
    /// `None` with fewer than `min_samples` returns.
    pub fn volatility(&self, now: DateTime<Utc>, window_secs: f64, min_samples: usize) -> Option<f64> {
        let start = now - secs(window_secs);
        let prices: Vec<f64> = self
            .points
            .iter()
            .filter(|p| p.timestamp >= start && p.timestamp <= now)
            .map(|p| p.price)
            .collect();

        let returns: Vec<f64> = prices
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect();

        if returns.len() < min_samples.max(2) {
            return None;
        }

        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        Some(variance.sqrt())
    }
}

fn secs(seconds: f64) -> Duration {
    Duration::milliseconds((seconds * 1000.0).round() as i64)
}
