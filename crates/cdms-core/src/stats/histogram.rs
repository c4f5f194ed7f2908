//! Fundamental-frequency histogram

use serde::{Deserialize, Serialize};

/// Rebuild the bins after every Nth value
pub const REBUCKET_EVERY: usize = 5;

/// Fewest bins drawn
pub const MIN_BINS: usize = 20;

/// Most bins drawn
pub const MAX_BINS: usize = 80;

/// One histogram bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    /// Bin centre in kHz
    pub center_khz: f64,
    /// Values that fell in the bin
    pub count: u64,
    /// Bin width in kHz
    pub width_khz: f64,
}

/// Equal-width bins over `[min, max]` of `values_khz`
///
/// Roughly one bin per kHz of span, clamped to 20..=80. A single distinct
/// value is centred in a 1 kHz wide range. The last bin includes its right
/// edge.
pub fn bucket(values_khz: &[f64]) -> Vec<HistogramBin> {
    let Some(first) = values_khz.first() else {
        return Vec::new();
    };

    let (mut lo, mut hi) = values_khz
        .iter()
        .fold((*first, *first), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if lo == hi {
        lo -= 0.5;
        hi += 0.5;
    }

    let span = hi - lo;
    let n_bins = (span.max(10.0) as usize).clamp(MIN_BINS, MAX_BINS);
    let width = span / n_bins as f64;

    let mut counts = vec![0u64; n_bins];
    for &v in values_khz {
        let idx = (((v - lo) / width) as usize).min(n_bins - 1);
        counts[idx] += 1;
    }

    counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| HistogramBin {
            center_khz: lo + (i as f64 + 0.5) * width,
            count,
            width_khz: width,
        })
        .collect()
}

/// Histogram over every fundamental seen this run, re-bucketed in batches
#[derive(Debug, Default, Clone)]
pub struct FrequencyHistogram {
    values_khz: Vec<f64>,
    bins: Vec<HistogramBin>,
}

impl FrequencyHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fundamental; returns true if the bins were rebuilt
    pub fn push(&mut self, f0_khz: f64) -> bool {
        self.values_khz.push(f0_khz);
        if self.values_khz.len() % REBUCKET_EVERY == 0 {
            self.bins = bucket(&self.values_khz);
            true
        } else {
            false
        }
    }

    /// Bins as of the last rebuild
    pub fn bins(&self) -> &[HistogramBin] {
        &self.bins
    }

    /// Fundamentals collected so far
    pub fn len(&self) -> usize {
        self.values_khz.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values_khz.is_empty()
    }

    pub fn clear(&mut self) {
        self.values_khz.clear();
        self.bins.clear();
    }
}
