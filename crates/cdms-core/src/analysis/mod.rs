//! Spectral analysis of waveform blocks

pub mod analyzer;
pub mod event;
