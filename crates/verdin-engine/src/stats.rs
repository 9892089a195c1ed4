//! Instrumentation
//!
//! Counters the engine keeps about its own behavior, plus the per-VM
//! response-time windows the predictive policy steers by.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use verdin_core::SimTime;

/// Sliding window of recent response times for one VM.
///
/// The trend is the relative change between the mean of the older half
/// and the mean of the newer half; a positive value means responses are
/// getting slower.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseWindow {
    samples: VecDeque<SimTime>,
}

impl ResponseWindow {
    pub const CAPACITY: usize = 10;

    pub fn record(&mut self, response_time: SimTime) {
        if self.samples.len() == Self::CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(response_time);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean response time over the window, `None` if empty.
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64)
    }

    /// Relative slope between the first-half mean and the second-half
    /// mean. Needs at least four samples to say anything.
    pub fn slope(&self) -> Option<f64> {
        if self.samples.len() < 4 {
            return None;
        }
        let mid = self.samples.len() / 2;
        let older: f64 = self.samples.iter().take(mid).sum::<u64>() as f64 / mid as f64;
        let newer_len = self.samples.len() - mid;
        let newer: f64 = self.samples.iter().skip(mid).sum::<u64>() as f64 / newer_len as f64;
        if older == 0.0 {
            return None;
        }
        Some(newer / older - 1.0)
    }
}

/// Aggregate counters over one engine run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instrumentation {
    pub tasks_placed: u64,
    pub tasks_completed: u64,
    pub placements_deferred: u64,
    pub placement_failures: u64,
    pub sla_warnings: u64,
    pub memory_warnings: u64,
    pub migrations_started: u64,
    pub migrations_completed: u64,
    pub machines_woken: u64,
    pub machines_slept: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_caps_at_ten() {
        let mut w = ResponseWindow::default();
        for i in 0..15 {
            w.record(i);
        }
        assert_eq!(w.len(), ResponseWindow::CAPACITY);
        // Oldest samples fell off
        assert_eq!(w.mean(), Some((5..15).sum::<u64>() as f64 / 10.0));
    }

    #[test]
    fn test_slope_positive_when_slowing_down() {
        let mut w = ResponseWindow::default();
        for rt in [100, 100, 100, 100, 100, 115, 115, 115, 115, 115] {
            w.record(rt);
        }
        let slope = w.slope().unwrap();
        assert!((slope - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_slope_negative_when_speeding_up() {
        let mut w = ResponseWindow::default();
        for rt in [200, 200, 200, 200, 200, 100, 100, 100, 100, 100] {
            w.record(rt);
        }
        assert!(w.slope().unwrap() < -0.1);
    }

    #[test]
    fn test_slope_needs_samples() {
        let mut w = ResponseWindow::default();
        w.record(10);
        w.record(20);
        w.record(30);
        assert_eq!(w.slope(), None);
    }
}
