use std::collections::VecDeque;

/// Bounded FIFO of the most recent samples.
///
/// Holds at most `capacity` values; pushing into a full window evicts the
/// oldest one. Every value is accepted, including negative or out-of-range
/// readings, so a burst of anomalous samples still ages the older ones out.
#[derive(Clone, Debug)]
pub struct SampleWindow<T = f64> {
    window: VecDeque<T>,
    capacity: usize,
}

impl<T> SampleWindow<T> {
    /// Create a new window holding up to `capacity` samples (at least 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        SampleWindow {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest one when full
    pub fn add_sample(&mut self, value: T) {
        self.window.push_back(value);
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }
    }

    /// Get current window size (actual, not max)
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Check if window is empty
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.window.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recent sample
    pub fn last(&self) -> Option<&T> {
        self.window.back()
    }

    /// Samples from oldest to newest
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.window.iter()
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}

impl SampleWindow<f64> {
    /// Arithmetic mean, 0 when empty
    pub fn mean(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    /// Population standard deviation; 0 with fewer than 2 samples
    pub fn stddev(&self) -> f64 {
        if self.window.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .window
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / self.window.len() as f64;
        variance.sqrt()
    }
}

impl SampleWindow<bool> {
    /// Number of `true` samples among the newest `n`
    pub fn count_recent_true(&self, n: usize) -> usize {
        self.window.iter().rev().take(n).filter(|v| **v).count()
    }
}
