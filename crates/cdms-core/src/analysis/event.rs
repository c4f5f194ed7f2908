//! Classified events produced by the analyzer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ion content of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    /// No spectral line above threshold
    NoIon,
    /// One ion (harmonic structure, or a lone line)
    Single,
    /// Several inharmonic lines
    Multiple,
}

impl EventClass {
    /// All classes in display order
    pub const ALL: [EventClass; 3] = [EventClass::NoIon, EventClass::Single, EventClass::Multiple];

    /// Short machine-friendly label
    pub fn as_str(&self) -> &'static str {
        match self {
            EventClass::NoIon => "no_ion",
            EventClass::Single => "single",
            EventClass::Multiple => "multiple",
        }
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of one block
///
/// Immutable once created; the analyzer hands it to the aggregator by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventResult {
    /// Ion content
    pub class: EventClass,
    /// Frequency of the strongest line above threshold (None for `NoIon`)
    pub fundamental_hz: Option<f64>,
    /// Strongest line over the noise floor in dB (None for `NoIon`)
    pub snr_db: Option<f64>,
    /// Number of spectral bins above threshold
    pub peak_count: usize,
    /// When the analysis ran
    pub timestamp: DateTime<Utc>,
    /// Production index of the source block
    pub sequence: u64,
    /// Transform length after zero padding
    pub fft_len: usize,
    /// Sample rate of the source block
    pub fs_hz: f64,
}

impl EventResult {
    /// Width of one spectral bin in Hz
    pub fn bin_width_hz(&self) -> f64 {
        self.fs_hz / self.fft_len as f64
    }

    /// Fundamental in kHz, as shown to operators
    pub fn fundamental_khz(&self) -> Option<f64> {
        self.fundamental_hz.map(|f| f / 1000.0)
    }
}
