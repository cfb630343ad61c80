// packages/engine/src/balance/cost.rs
//! Per-step cost smoothing

use std::collections::VecDeque;
use tracing::warn;

/// Mean of the last `window` samples
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: usize,
    samples: VecDeque<f64>,
    sum: f64,
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            sum: 0.0,
        }
    }

    /// Add a sample; non-finite or negative samples are dropped
    pub fn push(&mut self, sample: f64) {
        if !sample.is_finite() || sample < 0.0 {
            warn!("Ignoring cost sample {}", sample);
            return;
        }
        if self.samples.len() == self.window {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;
    }

    /// Current average, 0 before the first sample
    pub fn value(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            (self.sum / self.samples.len() as f64).max(0.0)
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_slides() {
        let mut avg = MovingAverage::new(3);
        assert_eq!(avg.value(), 0.0);
        for sample in [1.0, 2.0, 3.0] {
            avg.push(sample);
        }
        assert!((avg.value() - 2.0).abs() < 1e-12);
        avg.push(9.0);
        assert_eq!(avg.len(), 3);
        assert!((avg.value() - 14.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_bad_samples() {
        let mut avg = MovingAverage::new(0);
        avg.push(f64::NAN);
        avg.push(-1.0);
        assert!(avg.is_empty());
        avg.push(4.0);
        avg.push(6.0);
        // Window of 0 behaves as 1
        assert_eq!(avg.value(), 6.0);
        avg.reset();
        assert!(avg.is_empty());
    }
}
