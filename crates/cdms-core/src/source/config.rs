//! Acquisition configuration and validation
//!
//! A [`SourceConfig`] is validated once when a run starts and is immutable
//! for the duration of that run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Exclusive lower bound on the sample rate (Hz)
pub const MIN_FS_HZ: f64 = 100_000.0;

/// Inclusive upper bound on the sample rate (Hz)
pub const MAX_FS_HZ: f64 = 5_000_000.0;

/// Smallest block length accepted by a source
pub const MIN_N_SAMPLES: usize = 16_384;

/// Largest block length accepted by a source
pub const MAX_N_SAMPLES: usize = 1_048_576;

/// Shortest period between blocks (ms)
pub const MIN_PERIOD_MS: u64 = 10;

/// Longest period between blocks (ms)
pub const MAX_PERIOD_MS: u64 = 2000;

/// Errors raised when a configuration is rejected
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Sample rate {0} Hz outside (100 kHz, 5 MHz]")]
    SampleRateOutOfRange(f64),

    #[error("Block length {0} outside [16384, 1048576] samples")]
    BlockLengthOutOfRange(usize),

    #[error("Period {0} ms outside [10, 2000] ms")]
    PeriodOutOfRange(u64),

    #[error("Probability {name} = {value} outside [0, 1]")]
    ProbabilityOutOfRange { name: &'static str, value: f64 },

    #[error("Invalid f0 range ({lo} Hz, {hi} Hz) for sample rate {fs_hz} Hz")]
    InvalidFrequencyRange { lo: f64, hi: f64, fs_hz: f64 },

    #[error("SNR must be finite, got {0} dB")]
    InvalidSnr(f64),

    #[error("Block limit must be at least 1")]
    ZeroBlockLimit,
}

/// Which waveform source to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Software generator, no hardware required
    #[default]
    Synthetic,
    /// Digitizer in triggered one-capture-per-event mode
    PhysicalRapidBlock,
    /// Digitizer in continuous capture mode, chunked into blocks
    PhysicalStreaming,
}

impl SourceKind {
    /// Whether this source needs a digitizer driver
    pub fn is_physical(&self) -> bool {
        !matches!(self, SourceKind::Synthetic)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Synthetic => write!(f, "synthetic"),
            SourceKind::PhysicalRapidBlock => write!(f, "scope (rapid block)"),
            SourceKind::PhysicalStreaming => write!(f, "scope (streaming)"),
        }
    }
}

fn default_fs_hz() -> f64 {
    crate::DEFAULT_FS_HZ
}

fn default_n_samples() -> usize {
    crate::DEFAULT_N_SAMPLES
}

fn default_period_ms() -> u64 {
    crate::DEFAULT_PERIOD_MS
}

/// Tuning knobs that only the synthetic generator reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Probability that a block carries no ion
    pub empty_prob: f64,
    /// Probability that a non-empty block carries a second ion
    pub multi_prob: f64,
    /// Range the fundamental is drawn from, in Hz
    pub f0_range: (f64, f64),
    /// Fundamental amplitude over the noise RMS, in dB
    pub snr_db: f64,
    /// Seed for reproducible runs (None = seeded from OS entropy)
    pub seed: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            empty_prob: 0.50,
            multi_prob: 0.15,
            f0_range: (20_000.0, 120_000.0),
            snr_db: 20.0,
            seed: None,
        }
    }
}

/// Validated acquisition configuration for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Sample rate in Hz
    #[serde(default = "default_fs_hz")]
    pub fs_hz: f64,
    /// Samples per block
    #[serde(default = "default_n_samples")]
    pub n_samples: usize,
    /// Period between blocks in milliseconds
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    /// Stop producing after this many blocks (None = run until stopped)
    #[serde(default)]
    pub block_limit: Option<u64>,
    /// Synthetic-only knobs
    #[serde(default)]
    pub synthetic: SyntheticConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            fs_hz: default_fs_hz(),
            n_samples: default_n_samples(),
            period_ms: default_period_ms(),
            block_limit: None,
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl SourceConfig {
    /// Check every field against its allowed range
    ///
    /// Synthetic knobs are validated regardless of source kind so a stored
    /// config never becomes invalid by switching sources.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.fs_hz > MIN_FS_HZ && self.fs_hz <= MAX_FS_HZ) {
            return Err(ConfigError::SampleRateOutOfRange(self.fs_hz));
        }
        if !(MIN_N_SAMPLES..=MAX_N_SAMPLES).contains(&self.n_samples) {
            return Err(ConfigError::BlockLengthOutOfRange(self.n_samples));
        }
        if !(MIN_PERIOD_MS..=MAX_PERIOD_MS).contains(&self.period_ms) {
            return Err(ConfigError::PeriodOutOfRange(self.period_ms));
        }
        if self.block_limit == Some(0) {
            return Err(ConfigError::ZeroBlockLimit);
        }

        let syn = &self.synthetic;
        for (name, value) in [("empty_prob", syn.empty_prob), ("multi_prob", syn.multi_prob)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ProbabilityOutOfRange { name, value });
            }
        }

        let (lo, hi) = syn.f0_range;
        let nyquist = self.fs_hz / 2.0;
        if !(lo.is_finite() && hi.is_finite() && lo > 0.0 && lo <= hi && hi < nyquist) {
            return Err(ConfigError::InvalidFrequencyRange {
                lo,
                hi,
                fs_hz: self.fs_hz,
            });
        }

        if !syn.snr_db.is_finite() {
            return Err(ConfigError::InvalidSnr(syn.snr_db));
        }

        Ok(())
    }

    /// Period between blocks
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}
