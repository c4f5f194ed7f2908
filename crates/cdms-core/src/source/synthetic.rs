//! Synthetic ion-signal generation
//!
//! Produces int16 blocks that look like a CDMS pickup trace: Gaussian
//! noise, optionally carrying one ion (a fundamental with 2nd and 3rd
//! harmonics) or two ions (an extra inharmonic tone). Runs without any
//! hardware, which makes it the default source.

use crate::source::config::SyntheticConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::f64::consts::PI;

/// Noise RMS in full-scale units before int16 scaling
pub const NOISE_RMS: f64 = 0.05;

/// Full-scale units to ADC counts
const ADC_SCALE: f64 = 1000.0;

/// Symmetric int16 clip level
const ADC_CLIP: f64 = 32767.0;

/// Relative amplitudes of the fundamental, 2nd and 3rd harmonic
const HARMONIC_WEIGHTS: [(f64, f64); 3] = [(1.0, 1.0), (2.0, 0.35), (3.0, 0.20)];

/// Amplitude of the second ion's tone relative to the first
const SECOND_ION_WEIGHT: f64 = 0.8;

/// Range of the second ion's frequency ratio to f0
const SECOND_ION_RATIO: (f64, f64) = (1.08, 1.20);

/// What the generator injected into a block
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Injection {
    /// Noise only
    Empty,
    /// One ion with fundamental `f0_hz`
    Single { f0_hz: f64 },
    /// One harmonic ion at `f0_hz` plus a pure tone at `f1_hz`
    Multiple { f0_hz: f64, f1_hz: f64 },
}

/// A generated block together with its ground truth
#[derive(Debug, Clone)]
pub struct SyntheticBlock {
    /// ADC samples
    pub samples: Vec<i16>,
    /// What was injected
    pub injection: Injection,
}

/// Synthetic CDMS waveform generator
///
/// # Example
/// ```
/// use cdms_core::source::config::SyntheticConfig;
/// use cdms_core::source::synthetic::{Injection, SyntheticGenerator};
///
/// let config = SyntheticConfig { empty_prob: 1.0, seed: Some(7), ..Default::default() };
/// let mut gen = SyntheticGenerator::new(2_400_000.0, 16_384, &config);
/// let block = gen.next_block();
/// assert_eq!(block.samples.len(), 16_384);
/// assert_eq!(block.injection, Injection::Empty);
/// ```
#[derive(Debug)]
pub struct SyntheticGenerator {
    fs_hz: f64,
    n_samples: usize,
    empty_prob: f64,
    multi_prob: f64,
    f0_range: (f64, f64),
    /// Fundamental amplitude in full-scale units
    amplitude: f64,
    rng: StdRng,
}

impl SyntheticGenerator {
    /// Create a generator for blocks of `n_samples` at `fs_hz`
    pub fn new(fs_hz: f64, n_samples: usize, config: &SyntheticConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            fs_hz,
            n_samples,
            empty_prob: config.empty_prob,
            multi_prob: config.multi_prob,
            f0_range: config.f0_range,
            amplitude: NOISE_RMS * 10f64.powf(config.snr_db / 20.0),
            rng,
        }
    }

    /// Generate the next block
    pub fn next_block(&mut self) -> SyntheticBlock {
        let u: f64 = self.rng.gen();

        let injection = if u < self.empty_prob {
            Injection::Empty
        } else {
            let f0_hz = self.draw_f0();
            if u > 1.0 - self.multi_prob {
                let ratio = self.rng.gen_range(SECOND_ION_RATIO.0..SECOND_ION_RATIO.1);
                Injection::Multiple {
                    f0_hz,
                    f1_hz: f0_hz * ratio,
                }
            } else {
                Injection::Single { f0_hz }
            }
        };

        let samples = self.render(injection);
        SyntheticBlock { samples, injection }
    }

    fn draw_f0(&mut self) -> f64 {
        let (lo, hi) = self.f0_range;
        if lo < hi {
            self.rng.gen_range(lo..=hi)
        } else {
            lo
        }
    }

    /// Render tones plus noise into clipped ADC counts
    fn render(&mut self, injection: Injection) -> Vec<i16> {
        let dt = 1.0 / self.fs_hz;

        let mut tones: Vec<(f64, f64)> = Vec::with_capacity(4);
        match injection {
            Injection::Empty => {}
            Injection::Single { f0_hz } => {
                self.push_ion(&mut tones, f0_hz);
            }
            Injection::Multiple { f0_hz, f1_hz } => {
                self.push_ion(&mut tones, f0_hz);
                tones.push((2.0 * PI * f1_hz, SECOND_ION_WEIGHT * self.amplitude));
            }
        }

        (0..self.n_samples)
            .map(|i| {
                let t = i as f64 * dt;
                let signal: f64 = tones.iter().map(|&(w, a)| a * (w * t).sin()).sum();
                let noise: f64 = self.rng.sample::<f64, _>(StandardNormal) * NOISE_RMS;
                ((signal + noise) * ADC_SCALE).clamp(-ADC_CLIP, ADC_CLIP) as i16
            })
            .collect()
    }

    fn push_ion(&self, tones: &mut Vec<(f64, f64)>, f0_hz: f64) {
        for (mult, weight) in HARMONIC_WEIGHTS {
            tones.push((2.0 * PI * mult * f0_hz, weight * self.amplitude));
        }
    }

    /// Sample rate in Hz
    pub fn fs_hz(&self) -> f64 {
        self.fs_hz
    }

    /// Samples per block
    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Fundamental amplitude in full-scale units
    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }
}
