//! FFT-based ion classification
//!
//! Each block is classified on its own:
//! 1. Zero-pad to a power of two and remove the DC offset
//! 2. Take the one-sided magnitude spectrum
//! 3. Estimate the noise floor from the upper 40% of bins
//! 4. Threshold at a multiple of the floor; the strongest line is the fundamental
//! 5. Look for energy near 2·f0 and 3·f0 to confirm a single ion's harmonic series

use crate::analysis::event::{EventClass, EventResult};
use crate::source::Block;
use chrono::Utc;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fraction of the spectrum below which bins are excluded from the noise floor.
///
/// Assumes the top 40% of the band never carries ion signal. This holds for
/// the synthetic source but has not been checked against instrument spectra.
pub const NOISE_BAND_START: f64 = 0.6;

/// Default threshold as a multiple of the noise floor
pub const DEFAULT_THRESHOLD_FACTOR: f64 = 6.0;

/// Harmonic multiples and their relative search tolerance
const HARMONIC_WINDOWS: [(f64, f64); 2] = [(2.0, 0.015), (3.0, 0.02)];

/// Blocks rejected before spectral processing
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MalformedBlock {
    #[error("Block has {len} samples, need at least 2")]
    TooShort { len: usize },

    #[error("Invalid sample rate: {0} Hz")]
    InvalidSampleRate(f64),

    #[error("Block contains non-finite samples")]
    NonFinite,
}

/// Analyzer tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Threshold as a multiple of the noise floor
    pub threshold_factor: f64,
    /// Fraction of the spectrum where the noise band begins
    pub noise_band_start: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            threshold_factor: DEFAULT_THRESHOLD_FACTOR,
            noise_band_start: NOISE_BAND_START,
        }
    }
}

/// Zero-padded transform length for a block of `n` samples
pub fn padded_len(n: usize) -> usize {
    n.next_power_of_two()
}

/// Population standard deviation of the magnitudes from `start_frac` upward
///
/// Falls back to the whole spectrum when the band is empty.
pub fn noise_floor(magnitudes: &[f32], start_frac: f64) -> f64 {
    let start = (start_frac * magnitudes.len() as f64) as usize;
    let band = if start < magnitudes.len() {
        &magnitudes[start..]
    } else {
        magnitudes
    };
    if band.is_empty() {
        return 0.0;
    }

    let n = band.len() as f64;
    let mean = band.iter().map(|&m| m as f64).sum::<f64>() / n;
    let var = band
        .iter()
        .map(|&m| {
            let d = m as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    var.sqrt()
}

/// Count harmonic multiples of `k0` with a bin above `threshold` nearby
fn harmonic_hits(magnitudes: &[f32], k0: usize, threshold: f64) -> usize {
    let last = magnitudes.len() - 1;
    HARMONIC_WINDOWS
        .iter()
        .filter(|&&(mult, tol)| {
            let km = (mult * k0 as f64).round();
            let lo = (km * (1.0 - tol)).floor() as usize;
            let hi = ((km * (1.0 + tol)).floor() as usize).min(last);
            // Harmonic past Nyquist
            if lo > hi {
                return false;
            }
            magnitudes[lo..=hi].iter().any(|&m| m as f64 > threshold)
        })
        .count()
}

/// Spectral ion classifier
///
/// Holds only an FFT planner and scratch buffers between calls; the result
/// for a block never depends on earlier blocks.
///
/// # Example
/// ```
/// use cdms_core::analysis::analyzer::SpectralAnalyzer;
/// use cdms_core::analysis::event::EventClass;
///
/// let mut analyzer = SpectralAnalyzer::default();
/// let silence = vec![0.0f32; 4096];
/// let result = analyzer.analyze_samples(&silence, 2_400_000.0, 0).unwrap();
/// assert_eq!(result.class, EventClass::NoIon);
/// ```
pub struct SpectralAnalyzer {
    config: AnalyzerConfig,
    planner: FftPlanner<f32>,
    buffer: Vec<Complex<f32>>,
    magnitudes: Vec<f32>,
}

impl SpectralAnalyzer {
    /// Create an analyzer with the given tuning
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config,
            planner: FftPlanner::new(),
            buffer: Vec::new(),
            magnitudes: Vec::new(),
        }
    }

    /// Classify an ADC block
    pub fn analyze(&mut self, block: &Block) -> Result<EventResult, MalformedBlock> {
        Self::check_shape(block.samples.len(), block.fs_hz)?;
        self.load(block.samples.iter().map(|&s| s as f32), block.samples.len());
        Ok(self.classify(block.fs_hz, block.sequence))
    }

    /// Classify floating-point samples (e.g. a digitizer trace in volts)
    pub fn analyze_samples(
        &mut self,
        samples: &[f32],
        fs_hz: f64,
        sequence: u64,
    ) -> Result<EventResult, MalformedBlock> {
        Self::check_shape(samples.len(), fs_hz)?;
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(MalformedBlock::NonFinite);
        }
        self.load(samples.iter().copied(), samples.len());
        Ok(self.classify(fs_hz, sequence))
    }

    fn check_shape(len: usize, fs_hz: f64) -> Result<(), MalformedBlock> {
        if len < 2 {
            return Err(MalformedBlock::TooShort { len });
        }
        if !(fs_hz.is_finite() && fs_hz > 0.0) {
            return Err(MalformedBlock::InvalidSampleRate(fs_hz));
        }
        Ok(())
    }

    /// Zero-pad into the FFT buffer and remove the mean of the padded signal
    fn load(&mut self, samples: impl Iterator<Item = f32>, len: usize) {
        let n = padded_len(len);
        self.buffer.clear();
        self.buffer.extend(samples.map(|x| Complex::new(x, 0.0)));
        self.buffer.resize(n, Complex::new(0.0, 0.0));

        let mean = self.buffer.iter().map(|c| c.re as f64).sum::<f64>() / n as f64;
        let mean = mean as f32;
        for c in &mut self.buffer {
            c.re -= mean;
        }
    }

    fn classify(&mut self, fs_hz: f64, sequence: u64) -> EventResult {
        let timestamp = Utc::now();
        let n = self.buffer.len();

        let fft = self.planner.plan_fft_forward(n);
        fft.process(&mut self.buffer);

        // One-sided spectrum of a real signal
        self.magnitudes.clear();
        self.magnitudes
            .extend(self.buffer[..n / 2 + 1].iter().map(|c| c.norm()));

        let floor = noise_floor(&self.magnitudes, self.config.noise_band_start);
        let threshold = self.config.threshold_factor * floor;

        let mut peak_count = 0usize;
        let mut k0 = 0usize;
        let mut k0_mag = f64::NEG_INFINITY;
        for (k, &m) in self.magnitudes.iter().enumerate() {
            let m = m as f64;
            if m > threshold {
                peak_count += 1;
                if m > k0_mag {
                    k0 = k;
                    k0_mag = m;
                }
            }
        }

        if peak_count == 0 {
            return EventResult {
                class: EventClass::NoIon,
                fundamental_hz: None,
                snr_db: None,
                peak_count: 0,
                timestamp,
                sequence,
                fft_len: n,
                fs_hz,
            };
        }

        let f0 = k0 as f64 * fs_hz / n as f64;
        let snr = k0_mag / (floor + 1e-12);
        let snr_db = 20.0 * snr.max(1e-9).log10();

        let hits = harmonic_hits(&self.magnitudes, k0, threshold);

        // A lone line with no harmonics still counts as one ion
        let class = if hits >= 1 {
            EventClass::Single
        } else if peak_count >= 2 {
            EventClass::Multiple
        } else {
            EventClass::Single
        };

        tracing::trace!(
            sequence,
            class = %class,
            f0_hz = f0,
            snr_db,
            peak_count,
            harmonic_hits = hits,
            "Block classified"
        );

        EventResult {
            class,
            fundamental_hz: Some(f0),
            snr_db: Some(snr_db),
            peak_count,
            timestamp,
            sequence,
            fft_len: n,
            fs_hz,
        }
    }

    /// Magnitude spectrum of the most recent block
    pub fn last_spectrum(&self) -> &[f32] {
        &self.magnitudes
    }

    /// Current tuning
    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }
}

impl Default for SpectralAnalyzer {
    fn default() -> Self {
        Self::new(AnalyzerConfig::default())
    }
}
