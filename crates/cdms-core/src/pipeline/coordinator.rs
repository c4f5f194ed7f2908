//! Pipeline lifecycle: start, stop, snapshot
//!
//! A run wires three threads together:
//!
//! ```text
//! source ──Block──▶ analyzer ──EventResult──▶ aggregator ──▶ SharedAggregator
//!   │                  │                                         ▲
//!   └──────────────────┴─────────── StatusEvent ──▶ front-end    └── snapshot()
//! ```
//!
//! Stopping disconnects the source's stop channel and waits a bounded time
//! for it to exit. The analyzer and aggregator then drain whatever is
//! already queued and exit on their own.

use crate::analysis::analyzer::AnalyzerConfig;
use crate::pipeline::status::{StatusEvent, StatusSink};
use crate::pipeline::workers::{spawn_aggregator, spawn_analyzer};
use crate::source::config::{ConfigError, SourceConfig, SourceKind};
use crate::source::scope::{CaptureMode, DriverFactory, ScopeSettings, ScopeSource};
use crate::source::{
    BackpressurePolicy, BlockSink, SourceContext, SourceHandle, SyntheticSource, WaveformSource,
};
use crate::stats::aggregator::{self, EventAggregator, SharedAggregator, Snapshot};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Results queued between analyzer and aggregator
const RESULT_QUEUE_DEPTH: usize = 64;

/// Poll interval while waiting for workers to drain
const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("{kind} source unavailable: {reason}")]
    SourceUnavailable { kind: SourceKind, reason: String },

    #[error("A {0} run is already active")]
    AlreadyRunning(SourceKind),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No run
    Idle,
    /// Source producing
    Running(SourceKind),
    /// Source exited on its own (block limit or failure); not yet stopped
    Finished(SourceKind),
}

/// Outcome of a stopped run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub kind: SourceKind,
    /// Blocks the source queued for analysis
    pub blocks: u64,
    pub duration: Duration,
    /// False if the source thread had to be detached
    pub clean: bool,
}

fn default_block_queue_depth() -> usize {
    4
}

fn default_stop_timeout_ms() -> u64 {
    3000
}

fn default_rate_tick_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

/// Wiring and timing options that hold across runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOptions {
    /// Blocks queued between source and analyzer
    #[serde(default = "default_block_queue_depth")]
    pub block_queue_depth: usize,
    #[serde(default)]
    pub backpressure: BackpressurePolicy,
    /// How long `stop` waits for the source thread
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Rate recomputation interval
    #[serde(default = "default_rate_tick_ms")]
    pub rate_tick_ms: u64,
    /// Clear statistics at every start
    #[serde(default = "default_true")]
    pub reset_on_start: bool,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub scope: ScopeSettings,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            block_queue_depth: default_block_queue_depth(),
            backpressure: BackpressurePolicy::default(),
            stop_timeout_ms: default_stop_timeout_ms(),
            rate_tick_ms: default_rate_tick_ms(),
            reset_on_start: true,
            analyzer: AnalyzerConfig::default(),
            scope: ScopeSettings::default(),
        }
    }
}

impl PipelineOptions {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn rate_tick(&self) -> Duration {
        Duration::from_millis(self.rate_tick_ms.max(1))
    }
}

struct ActiveRun {
    kind: SourceKind,
    source: SourceHandle,
    stop_tx: Option<Sender<()>>,
    workers: Vec<JoinHandle<()>>,
    started: Instant,
}

/// Owner of the source, analyzer, and aggregator for successive runs
///
/// # Example
/// ```no_run
/// use cdms_core::{Pipeline, SourceConfig, SourceKind};
///
/// let mut pipeline = Pipeline::default();
/// pipeline.start(SourceKind::Synthetic, SourceConfig::default()).unwrap();
/// std::thread::sleep(std::time::Duration::from_secs(2));
/// let snap = pipeline.snapshot();
/// println!("{} events, {:.1} evt/s", snap.total_events, snap.rate_evt_per_s);
/// pipeline.stop();
/// ```
pub struct Pipeline {
    options: PipelineOptions,
    aggregator: SharedAggregator,
    status: StatusSink,
    status_rx: Receiver<StatusEvent>,
    driver_factory: Option<DriverFactory>,
    run: Option<ActiveRun>,
    draining: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Create an idle pipeline
    pub fn new(options: PipelineOptions) -> Self {
        let (status, status_rx) = StatusSink::channel();
        Self {
            options,
            aggregator: EventAggregator::shared(),
            status,
            status_rx,
            driver_factory: None,
            run: None,
            draining: Vec::new(),
        }
    }

    /// Install the digitizer driver used by physical sources
    pub fn with_driver_factory(mut self, factory: DriverFactory) -> Self {
        self.driver_factory = Some(factory);
        self
    }

    /// Start a run
    ///
    /// Fails without side effects on an invalid config, an unavailable
    /// source, or while another run is active. A run whose source already
    /// finished on its own is stopped first.
    pub fn start(&mut self, kind: SourceKind, config: SourceConfig) -> Result<(), PipelineError> {
        if let Some(run) = &self.run {
            if !run.source.is_finished() {
                return Err(PipelineError::AlreadyRunning(run.kind));
            }
            self.stop();
        }

        config.validate()?;
        self.reap_workers();

        let source = self.open_source(kind, &config)?;

        let (analyzer_alive, analyzer_watch) = bounded::<()>(0);
        let (sink, block_rx) =
            BlockSink::channel(self.options.block_queue_depth, self.options.backpressure);
        let sink = sink.watch_consumer(analyzer_watch);
        let (result_tx, result_rx) = bounded(RESULT_QUEUE_DEPTH);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let aggregator_thread = spawn_aggregator(
            result_rx,
            SharedAggregator::clone(&self.aggregator),
            self.options.rate_tick(),
        )?;
        let analyzer_thread = spawn_analyzer(
            block_rx,
            result_tx,
            self.status.clone(),
            self.options.analyzer.clone(),
            analyzer_alive,
        )?;

        let fs_hz = source.fs_hz();
        let n_samples = source.n_samples();
        tracing::info!(
            kind = %kind,
            fs_hz,
            n_samples,
            period_ms = config.period_ms,
            block_limit = ?config.block_limit,
            "Pipeline starting"
        );
        let ctx = SourceContext::new(kind, sink, stop_rx, self.status.clone(), config.block_limit);
        let mut source = source.spawn_paused(ctx)?;

        // Nothing has been produced yet, so the reset and the start notice
        // precede every result and status of this run
        if self.options.reset_on_start {
            aggregator::lock(&self.aggregator).reset();
        }
        self.status.emit(StatusEvent::SourceStarted {
            kind,
            fs_hz,
            n_samples,
        });
        source.release();

        self.run = Some(ActiveRun {
            kind,
            source,
            stop_tx: Some(stop_tx),
            workers: vec![analyzer_thread, aggregator_thread],
            started: Instant::now(),
        });
        Ok(())
    }

    fn open_source(
        &self,
        kind: SourceKind,
        config: &SourceConfig,
    ) -> Result<WaveformSource, PipelineError> {
        let mode = match kind {
            SourceKind::Synthetic => {
                return Ok(WaveformSource::Synthetic(SyntheticSource::new(config)))
            }
            SourceKind::PhysicalRapidBlock => CaptureMode::RapidBlock,
            SourceKind::PhysicalStreaming => CaptureMode::Streaming,
        };

        let opened = match &self.driver_factory {
            None => Err("no digitizer driver installed".to_string()),
            Some(factory) => factory()
                .and_then(|driver| {
                    ScopeSource::open(driver, mode, self.options.scope.clone(), config)
                })
                .map_err(|e| e.to_string()),
        };

        opened.map(WaveformSource::Scope).map_err(|reason| {
            self.status.emit(StatusEvent::SourceUnavailable {
                kind,
                reason: reason.clone(),
            });
            PipelineError::SourceUnavailable { kind, reason }
        })
    }

    /// Stop the active run
    ///
    /// Returns None if nothing was running. Results for blocks already
    /// queued may still be recorded after this returns.
    pub fn stop(&mut self) -> Option<RunSummary> {
        let mut run = self.run.take()?;

        // Disconnecting wakes the source from its period wait
        drop(run.stop_tx.take());
        let clean = run.source.join_timeout(self.options.stop_timeout());
        self.draining.append(&mut run.workers);

        let summary = RunSummary {
            kind: run.kind,
            blocks: run.source.produced(),
            duration: run.started.elapsed(),
            clean,
        };
        self.status.emit(StatusEvent::PipelineStopped {
            kind: summary.kind,
            blocks: summary.blocks,
            clean,
        });
        Some(summary)
    }

    /// Wait for a self-terminating run to finish, then stop it
    ///
    /// Waits up to `timeout` for the source, stops the run, and waits for
    /// every queued block to be analyzed and recorded. Meant for runs with a
    /// block limit.
    pub fn finish(&mut self, timeout: Duration) -> Option<RunSummary> {
        let deadline = Instant::now() + timeout;
        while self.state_is_running() && Instant::now() < deadline {
            std::thread::sleep(DRAIN_POLL);
        }
        let summary = self.stop();
        self.reap_workers();
        summary
    }

    fn state_is_running(&self) -> bool {
        matches!(self.state(), PipelineState::Running(_))
    }

    /// Join drained workers from earlier runs, detaching any that hang
    fn reap_workers(&mut self) {
        let deadline = Instant::now() + self.options.stop_timeout();
        while self.draining.iter().any(|h| !h.is_finished()) && Instant::now() < deadline {
            std::thread::sleep(DRAIN_POLL);
        }

        for handle in self.draining.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::warn!("Worker thread still draining, detaching");
            }
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> PipelineState {
        match &self.run {
            None => PipelineState::Idle,
            Some(run) if run.source.is_finished() => PipelineState::Finished(run.kind),
            Some(run) => PipelineState::Running(run.kind),
        }
    }

    /// Copy of the current statistics
    pub fn snapshot(&self) -> Snapshot {
        aggregator::lock(&self.aggregator).snapshot()
    }

    /// Clear statistics without touching the run
    pub fn reset(&self) {
        aggregator::lock(&self.aggregator).reset();
        tracing::info!("Statistics reset");
    }

    /// Receiver for status notifications
    pub fn status_events(&self) -> Receiver<StatusEvent> {
        self.status_rx.clone()
    }

    /// Shared handle to the statistics
    pub fn aggregator(&self) -> SharedAggregator {
        SharedAggregator::clone(&self.aggregator)
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(PipelineOptions::default())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
