//! Digitizer-backed sources
//!
//! The vendor SDK sits behind [`ScopeDriver`]; this module owns everything
//! above it: channel and trigger setup, timebase selection, the rapid block
//! capture loop, streaming chunking, and teardown. A driver is always closed
//! when the source exits, on every path.

use crate::source::config::{SourceConfig, SourceKind};
use crate::source::SourceContext;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Highest timebase index probed
pub const MAX_TIMEBASE: u32 = 10_000;

/// Relative interval error at which the timebase search stops early
const TIMEBASE_TOLERANCE: f64 = 0.02;

/// How often readiness is polled during a rapid block capture
const READY_POLL: Duration = Duration::from_millis(1);

/// How long to wait when a streaming read returns nothing
const STREAM_POLL: Duration = Duration::from_millis(5);

/// Driver-level failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScopeError {
    #[error("No digitizer found")]
    NotFound,

    #[error("Driver call {call} failed with status {status}")]
    Driver { call: &'static str, status: u32 },

    #[error("No timebase reachable near {fs_hz} Hz")]
    NoTimebase { fs_hz: f64 },

    #[error("Not supported by this driver: {0}")]
    Unsupported(&'static str),
}

/// Input channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Channel {
    #[default]
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
}

/// Input coupling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Coupling {
    Ac,
    #[default]
    Dc,
}

/// Input ranges a typical digitizer offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoltageRange {
    Mv10,
    Mv20,
    Mv50,
    Mv100,
    Mv200,
    Mv500,
    V1,
    V2,
    V5,
    V10,
    V20,
}

impl VoltageRange {
    const ALL: [VoltageRange; 11] = [
        VoltageRange::Mv10,
        VoltageRange::Mv20,
        VoltageRange::Mv50,
        VoltageRange::Mv100,
        VoltageRange::Mv200,
        VoltageRange::Mv500,
        VoltageRange::V1,
        VoltageRange::V2,
        VoltageRange::V5,
        VoltageRange::V10,
        VoltageRange::V20,
    ];

    /// Full-scale range in millivolts
    pub fn millivolts(&self) -> f64 {
        match self {
            VoltageRange::Mv10 => 10.0,
            VoltageRange::Mv20 => 20.0,
            VoltageRange::Mv50 => 50.0,
            VoltageRange::Mv100 => 100.0,
            VoltageRange::Mv200 => 200.0,
            VoltageRange::Mv500 => 500.0,
            VoltageRange::V1 => 1_000.0,
            VoltageRange::V2 => 2_000.0,
            VoltageRange::V5 => 5_000.0,
            VoltageRange::V10 => 10_000.0,
            VoltageRange::V20 => 20_000.0,
        }
    }

    /// Range closest to `volts` full scale
    pub fn nearest(volts: f64) -> VoltageRange {
        let mv = volts * 1000.0;
        let mut best = VoltageRange::V2;
        let mut best_err = f64::INFINITY;
        for range in Self::ALL {
            let err = (range.millivolts() - mv).abs();
            if err < best_err {
                best = range;
                best_err = err;
            }
        }
        best
    }
}

/// Front-end settings for a physical source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeSettings {
    pub channel: Channel,
    pub coupling: Coupling,
    /// Requested full-scale range in volts, snapped to the nearest supported range
    pub range_v: f64,
    /// Rising-edge trigger level in volts
    pub trigger_level_v: f64,
    /// Fraction of the block captured before the trigger
    pub pretrigger: f64,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            channel: Channel::A,
            coupling: Coupling::Dc,
            range_v: 2.0,
            trigger_level_v: 0.05,
            pretrigger: 0.05,
        }
    }
}

/// Convert a trigger level in volts to ADC counts for the given range
pub fn trigger_threshold_adc(level_v: f64, range: VoltageRange, max_adc: i16) -> i16 {
    let counts = level_v * 1000.0 * max_adc as f64 / range.millivolts();
    counts.clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// Thin layer over a vendor digitizer SDK
///
/// Every call maps onto one SDK function. Implementations report non-OK
/// status codes as [`ScopeError::Driver`].
pub trait ScopeDriver: Send {
    /// Open the first available unit
    fn open(&mut self) -> Result<(), ScopeError>;

    /// Enable and configure one input channel
    fn configure_channel(
        &mut self,
        channel: Channel,
        coupling: Coupling,
        range: VoltageRange,
    ) -> Result<(), ScopeError>;

    /// Largest ADC code the unit returns
    fn max_adc_value(&mut self) -> Result<i16, ScopeError>;

    /// Arm a rising-edge trigger; `auto_trigger_ms == 0` waits forever
    fn set_trigger(
        &mut self,
        channel: Channel,
        threshold_adc: i16,
        auto_trigger_ms: u32,
    ) -> Result<(), ScopeError>;

    /// Sample interval for `timebase`, or None if the unit rejects it
    fn sample_interval_ns(&mut self, timebase: u32, n_samples: usize) -> Option<f64>;

    /// Start one triggered capture
    fn run_block(
        &mut self,
        pre_trigger: usize,
        post_trigger: usize,
        timebase: u32,
    ) -> Result<(), ScopeError>;

    /// Whether the current capture has completed
    fn is_ready(&mut self) -> Result<bool, ScopeError>;

    /// Copy the completed capture into `buf`; returns samples written
    fn read_block(&mut self, buf: &mut [i16]) -> Result<usize, ScopeError>;

    /// Begin continuous capture at `interval_ns`
    fn start_streaming(&mut self, interval_ns: f64, buffer_len: usize)
        -> Result<(), ScopeError>;

    /// Copy whatever streaming data is available; returns samples written
    fn read_streaming(&mut self, buf: &mut [i16]) -> Result<usize, ScopeError>;

    /// Stop any capture in progress
    fn stop(&mut self) -> Result<(), ScopeError>;

    /// Release the unit
    fn close(&mut self);
}

/// Constructs a driver for a physical source
pub type DriverFactory = Box<dyn Fn() -> Result<Box<dyn ScopeDriver>, ScopeError> + Send + Sync>;

/// Find the timebase whose interval is closest to `1/fs_hz`
///
/// Probes indices 1.. in order and stops early once within 2%. Returns the
/// chosen index and its interval in nanoseconds.
pub fn choose_timebase(
    driver: &mut dyn ScopeDriver,
    fs_hz: f64,
    n_samples: usize,
) -> Result<(u32, f64), ScopeError> {
    let target_ns = 1e9 / fs_hz;
    let mut best: Option<(u32, f64, f64)> = None;

    for timebase in 1..=MAX_TIMEBASE {
        let Some(interval) = driver.sample_interval_ns(timebase, n_samples) else {
            continue;
        };
        let err = (interval - target_ns).abs();
        if best.map_or(true, |(_, _, best_err)| err < best_err) {
            best = Some((timebase, interval, err));
            if err / target_ns < TIMEBASE_TOLERANCE {
                break;
            }
        }
    }

    best.map(|(timebase, interval, _)| (timebase, interval))
        .ok_or(ScopeError::NoTimebase { fs_hz })
}

/// Capture mode of a physical source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    RapidBlock,
    Streaming,
}

/// An opened and configured digitizer; closed on drop
pub struct ScopeSource {
    driver: Box<dyn ScopeDriver>,
    mode: CaptureMode,
    settings: ScopeSettings,
    n_samples: usize,
    timebase: u32,
    interval_ns: f64,
}

impl ScopeSource {
    /// Open and configure the unit
    ///
    /// On failure the driver is closed before the error is returned.
    pub fn open(
        mut driver: Box<dyn ScopeDriver>,
        mode: CaptureMode,
        settings: ScopeSettings,
        config: &SourceConfig,
    ) -> Result<Self, ScopeError> {
        match Self::configure(driver.as_mut(), mode, &settings, config) {
            Ok((timebase, interval_ns)) => {
                tracing::info!(
                    timebase,
                    fs_hz = 1e9 / interval_ns,
                    requested_fs_hz = config.fs_hz,
                    "Digitizer configured"
                );
                Ok(Self {
                    driver,
                    mode,
                    settings,
                    n_samples: config.n_samples,
                    timebase,
                    interval_ns,
                })
            }
            Err(e) => {
                driver.close();
                Err(e)
            }
        }
    }

    fn configure(
        driver: &mut dyn ScopeDriver,
        mode: CaptureMode,
        settings: &ScopeSettings,
        config: &SourceConfig,
    ) -> Result<(u32, f64), ScopeError> {
        driver.open()?;
        let range = VoltageRange::nearest(settings.range_v);
        driver.configure_channel(settings.channel, settings.coupling, range)?;

        if mode == CaptureMode::RapidBlock {
            let max_adc = driver.max_adc_value()?;
            let threshold = trigger_threshold_adc(settings.trigger_level_v, range, max_adc);
            driver.set_trigger(settings.channel, threshold, 0)?;
        }

        choose_timebase(driver, config.fs_hz, config.n_samples)
    }

    /// Kind reported to the pipeline
    pub fn kind(&self) -> SourceKind {
        match self.mode {
            CaptureMode::RapidBlock => SourceKind::PhysicalRapidBlock,
            CaptureMode::Streaming => SourceKind::PhysicalStreaming,
        }
    }

    /// Achieved sample rate
    pub fn fs_hz(&self) -> f64 {
        1e9 / self.interval_ns
    }

    /// Samples per block
    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Timebase index in use
    pub fn timebase(&self) -> u32 {
        self.timebase
    }

    /// Run the capture loop until stop, block limit, or error
    pub(crate) fn run(&mut self, ctx: &mut SourceContext) -> Result<(), ScopeError> {
        match self.mode {
            CaptureMode::RapidBlock => self.run_rapid_block(ctx),
            CaptureMode::Streaming => self.run_streaming(ctx),
        }
    }

    /// One triggered capture per block; the trigger paces the loop
    fn run_rapid_block(&mut self, ctx: &mut SourceContext) -> Result<(), ScopeError> {
        let fs_hz = self.fs_hz();
        let pre = (self.n_samples as f64 * self.settings.pretrigger) as usize;
        let post = self.n_samples - pre;
        let mut buf = vec![0i16; self.n_samples];

        while !ctx.stop_requested() && !ctx.limit_reached() {
            self.driver.run_block(pre, post, self.timebase)?;

            while !self.driver.is_ready()? {
                if !ctx.wait(READY_POLL) {
                    return Ok(());
                }
            }

            let captured = self.driver.read_block(&mut buf)?.min(buf.len());
            self.driver.stop()?;

            if !ctx.emit(buf[..captured].to_vec(), fs_hz) {
                break;
            }
        }
        Ok(())
    }

    /// Continuous capture, cut into blocks of exactly `n_samples`
    fn run_streaming(&mut self, ctx: &mut SourceContext) -> Result<(), ScopeError> {
        let fs_hz = self.fs_hz();
        let n = self.n_samples;
        self.driver.start_streaming(self.interval_ns, n)?;

        let mut pending: Vec<i16> = Vec::with_capacity(n);
        let mut chunk = vec![0i16; n];

        while !ctx.stop_requested() && !ctx.limit_reached() {
            let want = n - pending.len();
            let got = self.driver.read_streaming(&mut chunk[..want])?.min(want);
            pending.extend_from_slice(&chunk[..got]);

            if pending.len() == n {
                let block = std::mem::replace(&mut pending, Vec::with_capacity(n));
                if !ctx.emit(block, fs_hz) {
                    break;
                }
            } else if got == 0 && !ctx.wait(STREAM_POLL) {
                break;
            }
        }
        Ok(())
    }
}

impl Drop for ScopeSource {
    fn drop(&mut self) {
        if let Err(e) = self.driver.stop() {
            tracing::debug!(error = %e, "Stop during teardown failed");
        }
        self.driver.close();
        tracing::debug!("Digitizer closed");
    }
}
