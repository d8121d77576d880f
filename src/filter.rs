// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Exponential smoothing for raw temperature samples.

/// Smoothing factor applied to every new sample.
pub const DEFAULT_ALPHA: f64 = 0.1;

/// First-order low-pass filter. The first sample passes through unsmoothed.
#[derive(Debug, Clone)]
pub struct LowPassFilter {
    alpha: f64,
    filtered: Option<f64>,
}

impl LowPassFilter {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            filtered: None,
        }
    }

    /// Feed a sample and return the new filtered value.
    pub fn apply(&mut self, sample: f64) -> f64 {
        let next = match self.filtered {
            None => sample,
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
        };
        self.filtered = Some(next);
        next
    }

    /// Force the filter state to `value`, discarding history.
    pub fn seed(&mut self, value: f64) {
        self.filtered = Some(value);
    }

    pub fn value(&self) -> Option<f64> {
        self.filtered
    }
}

impl Default for LowPassFilter {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA)
    }
}
