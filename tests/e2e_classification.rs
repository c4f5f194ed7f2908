//! E2E tests for spectral ion classification
//!
//! Feeds synthetic and hand-built waveforms through the analyzer and checks
//! the classification, fundamental, and SNR against the injected truth.

use approx::assert_abs_diff_eq;
use cdms_monitor::analysis::analyzer::{AnalyzerConfig, MalformedBlock, SpectralAnalyzer};
use cdms_monitor::source::config::SyntheticConfig;
use cdms_monitor::source::synthetic::{Injection, SyntheticGenerator};
use cdms_monitor::source::Block;
use cdms_monitor::EventClass;
use chrono::Utc;
use std::f64::consts::PI;

const FS: f64 = 2_400_000.0;

fn to_block(samples: Vec<i16>, sequence: u64) -> Block {
    Block {
        samples,
        fs_hz: FS,
        captured_at: Utc::now(),
        sequence,
    }
}

fn generator(n: usize, config: SyntheticConfig) -> SyntheticGenerator {
    SyntheticGenerator::new(FS, n, &config)
}

/// A single ion at 50 kHz, 20 dB, is classified Single within one bin
#[test]
fn test_single_ion_at_instrument_settings() {
    let n = 262_144;
    let mut gen = generator(
        n,
        SyntheticConfig {
            empty_prob: 0.0,
            multi_prob: 0.0,
            f0_range: (50_000.0, 50_000.0),
            snr_db: 20.0,
            seed: Some(2024),
        },
    );
    let mut analyzer = SpectralAnalyzer::default();

    for seq in 0..3 {
        let block = gen.next_block();
        assert_eq!(block.injection, Injection::Single { f0_hz: 50_000.0 });

        let result = analyzer.analyze(&to_block(block.samples, seq)).unwrap();
        assert_eq!(result.class, EventClass::Single);
        assert_eq!(result.fft_len, n);

        let f0 = result.fundamental_hz.unwrap();
        assert!(
            (f0 - 50_000.0).abs() <= result.bin_width_hz(),
            "f0 {} Hz more than one bin from 50 kHz",
            f0
        );
        assert!(result.snr_db.unwrap() >= 20.0);
    }
}

/// Pure noise never reaches the SNR of a 20 dB ion at the default threshold
#[test]
fn test_noise_snr_stays_below_ion_level() {
    let mut gen = generator(
        16_384,
        SyntheticConfig {
            empty_prob: 1.0,
            seed: Some(7),
            ..Default::default()
        },
    );
    let mut analyzer = SpectralAnalyzer::default();

    for seq in 0..20 {
        let block = gen.next_block();
        let result = analyzer.analyze(&to_block(block.samples, seq)).unwrap();
        if let Some(snr) = result.snr_db {
            assert!(snr < 20.0, "noise block {} reached {:.1} dB", seq, snr);
        }
    }
}

/// With a raised threshold, pure noise is almost never flagged
#[test]
fn test_noise_false_detection_rate_with_raised_threshold() {
    let mut gen = generator(
        16_384,
        SyntheticConfig {
            empty_prob: 1.0,
            seed: Some(8),
            ..Default::default()
        },
    );
    let mut analyzer = SpectralAnalyzer::new(AnalyzerConfig {
        threshold_factor: 9.0,
        ..Default::default()
    });

    let detections = (0..20)
        .map(|seq| analyzer.analyze(&to_block(gen.next_block().samples, seq)).unwrap())
        .filter(|r| r.class != EventClass::NoIon)
        .count();
    assert!(detections <= 1, "{} of 20 noise blocks flagged", detections);
}

/// Two-ion injections still carry f0's harmonics, so they read as Single
#[test]
fn test_two_ion_injection_with_harmonics_reads_single() {
    let mut gen = generator(
        65_536,
        SyntheticConfig {
            empty_prob: 0.0,
            multi_prob: 1.0,
            f0_range: (40_000.0, 60_000.0),
            snr_db: 20.0,
            seed: Some(9),
        },
    );
    let mut analyzer = SpectralAnalyzer::default();

    let block = gen.next_block();
    let Injection::Multiple { f0_hz, .. } = block.injection else {
        panic!("expected a two-ion block, got {:?}", block.injection);
    };
    let result = analyzer.analyze(&to_block(block.samples, 0)).unwrap();
    assert_eq!(result.class, EventClass::Single);
    assert!((result.fundamental_hz.unwrap() - f0_hz).abs() <= result.bin_width_hz());
}

/// Two inharmonic lines with no overtones are Multiple
#[test]
fn test_inharmonic_pair_is_multiple() {
    let n = 4096;
    let samples: Vec<f32> = (0..n)
        .map(|i| {
            let t = i as f64 / n as f64;
            let x = 1.0 * (2.0 * PI * 100.0 * t).sin() + 0.8 * (2.0 * PI * 115.0 * t).sin();
            // Small deterministic dither keeps the noise floor above zero
            let dither = 1e-3 * ((i * 7919) % 101) as f64 / 101.0;
            (x + dither) as f32
        })
        .collect();

    let mut analyzer = SpectralAnalyzer::default();
    let result = analyzer.analyze_samples(&samples, FS, 0).unwrap();
    assert_eq!(result.class, EventClass::Multiple);
    assert_abs_diff_eq!(
        result.fundamental_hz.unwrap(),
        100.0 * FS / n as f64,
        epsilon = 1e-6
    );
}

/// Lengths 0 and 1 are rejected before analysis
#[test]
fn test_degenerate_lengths_are_malformed() {
    let mut analyzer = SpectralAnalyzer::default();
    assert_eq!(
        analyzer.analyze(&to_block(vec![], 0)),
        Err(MalformedBlock::TooShort { len: 0 })
    );
    assert_eq!(
        analyzer.analyze(&to_block(vec![5], 1)),
        Err(MalformedBlock::TooShort { len: 1 })
    );
}

/// Power-of-two blocks are transformed at their own length
#[test]
fn test_power_of_two_block_is_not_padded() {
    let mut gen = generator(
        16_384,
        SyntheticConfig {
            seed: Some(10),
            ..Default::default()
        },
    );
    let mut analyzer = SpectralAnalyzer::default();
    let result = analyzer.analyze(&to_block(gen.next_block().samples, 0)).unwrap();
    assert_eq!(result.fft_len, 16_384);
}

/// Same block, same answer
#[test]
fn test_analysis_is_deterministic() {
    let mut gen = generator(
        16_384,
        SyntheticConfig {
            empty_prob: 0.0,
            seed: Some(12),
            ..Default::default()
        },
    );
    let samples = gen.next_block().samples;

    let mut a = SpectralAnalyzer::default();
    let mut b = SpectralAnalyzer::default();
    let ra = a.analyze(&to_block(samples.clone(), 0)).unwrap();
    let rb = b.analyze(&to_block(samples, 0)).unwrap();
    assert_eq!(ra.class, rb.class);
    assert_eq!(ra.fundamental_hz, rb.fundamental_hz);
    assert_eq!(ra.snr_db, rb.snr_db);
    assert_eq!(ra.peak_count, rb.peak_count);
}
