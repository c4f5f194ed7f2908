//! CDMS Core - Waveform sources, spectral classification, and event statistics
//!
//! This library implements the read-out path of a charge-detection mass
//! spectrometer: a [`source`] emits fixed-length digitizer blocks, the
//! [`analysis`] stage classifies each block as containing no ion, a single
//! ion, or multiple ions, and the [`stats`] aggregator accumulates live
//! counters, rate, and a fundamental-frequency histogram. The [`pipeline`]
//! coordinator wires the three together across threads.

pub mod analysis;
pub mod pipeline;
pub mod source;
pub mod stats;

pub use analysis::analyzer::{AnalyzerConfig, MalformedBlock, SpectralAnalyzer};
pub use analysis::event::{EventClass, EventResult};
pub use pipeline::coordinator::{
    Pipeline, PipelineError, PipelineOptions, PipelineState, RunSummary,
};
pub use pipeline::status::StatusEvent;
pub use source::config::{ConfigError, SourceConfig, SourceKind, SyntheticConfig};
pub use source::scope::{DriverFactory, ScopeDriver, ScopeError, ScopeSettings};
pub use source::{BackpressurePolicy, Block};
pub use stats::aggregator::{EventAggregator, SharedAggregator, Snapshot};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (YYYY-MM-DD), stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Default digitizer sample rate (2.4 MHz)
pub const DEFAULT_FS_HZ: f64 = 2_400_000.0;

/// Default samples per event block (2^18)
pub const DEFAULT_N_SAMPLES: usize = 262_144;

/// Default period between blocks in milliseconds
pub const DEFAULT_PERIOD_MS: u64 = 250;

/// Capacity of the recent-event log kept by the aggregator
pub const EVENT_LOG_CAPACITY: usize = 500;
