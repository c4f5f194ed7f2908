//! Waveform sources
//!
//! A source runs on its own named thread and pushes fixed-length [`Block`]s
//! into a bounded channel until it is stopped, reaches its block limit, or
//! fails. The set of sources is closed: synthetic, or a digitizer in rapid
//! block or streaming mode.

pub mod config;
pub mod scope;
pub mod synthetic;

use crate::pipeline::status::{StatusEvent, StatusSink};
use crate::source::config::{SourceConfig, SourceKind};
use crate::source::scope::ScopeSource;
use crate::source::synthetic::SyntheticGenerator;
use chrono::{DateTime, Utc};
use crossbeam_channel::{
    bounded, never, select, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Emit a backpressure notification on the first drop and every Nth after
const BACKPRESSURE_REPORT_EVERY: u64 = 10;

/// One acquisition: a fixed-length run of signed 16-bit ADC samples
#[derive(Debug, Clone)]
pub struct Block {
    /// ADC samples
    pub samples: Vec<i16>,
    /// Sample rate in Hz (the digitizer's achieved rate for physical sources)
    pub fs_hz: f64,
    /// When the block left the source
    pub captured_at: DateTime<Utc>,
    /// Production index within the run, starting at 0
    pub sequence: u64,
}

/// What a source does when the analyzer falls behind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Discard the oldest queued block to make room
    #[default]
    DropOldest,
    /// Wait for room; stop requests still interrupt the wait
    Block,
}

/// Result of handing a block to the analyzer queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued
    Queued,
    /// Stop was requested while waiting for room
    Stopped,
    /// The analyzer side is gone
    Disconnected,
}

/// Producer side of the block queue, applying the backpressure policy
///
/// The sink keeps its own receiver for drop-oldest eviction, so the queue
/// itself never disconnects. A consumer that wants its exit noticed hands
/// over the receiving end of a liveness channel via
/// [`BlockSink::watch_consumer`] and holds the sender for as long as it runs.
pub struct BlockSink {
    tx: Sender<Block>,
    overflow: Receiver<Block>,
    consumer: Receiver<()>,
    policy: BackpressurePolicy,
    dropped: u64,
}

impl BlockSink {
    /// Create a sink with room for `depth` blocks and the analyzer's receiver
    pub fn channel(depth: usize, policy: BackpressurePolicy) -> (BlockSink, Receiver<Block>) {
        let (tx, rx) = bounded(depth.max(1));
        (
            BlockSink {
                tx,
                overflow: rx.clone(),
                consumer: never(),
                policy,
                dropped: 0,
            },
            rx,
        )
    }

    /// Report [`Delivery::Disconnected`] once every sender of `alive` is gone
    pub fn watch_consumer(mut self, alive: Receiver<()>) -> Self {
        self.consumer = alive;
        self
    }

    fn consumer_gone(&self) -> bool {
        matches!(self.consumer.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn send(&mut self, block: Block, stop: &Receiver<()>, status: &StatusSink) -> Delivery {
        if self.consumer_gone() {
            return Delivery::Disconnected;
        }
        match self.policy {
            BackpressurePolicy::DropOldest => {
                let mut block = block;
                loop {
                    match self.tx.try_send(block) {
                        Ok(()) => return Delivery::Queued,
                        Err(TrySendError::Full(b)) => {
                            block = b;
                            if self.overflow.try_recv().is_ok() {
                                self.dropped += 1;
                                if self.dropped == 1
                                    || self.dropped % BACKPRESSURE_REPORT_EVERY == 0
                                {
                                    status.emit(StatusEvent::Backpressure {
                                        dropped_total: self.dropped,
                                    });
                                }
                            }
                        }
                        Err(TrySendError::Disconnected(_)) => return Delivery::Disconnected,
                    }
                }
            }
            BackpressurePolicy::Block => {
                let tx = &self.tx;
                let consumer = &self.consumer;
                select! {
                    send(tx, block) -> res => match res {
                        Ok(()) => Delivery::Queued,
                        Err(_) => Delivery::Disconnected,
                    },
                    recv(stop) -> _ => Delivery::Stopped,
                    recv(consumer) -> _ => Delivery::Disconnected,
                }
            }
        }
    }

    /// Blocks discarded so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Everything a running source needs from the pipeline
pub struct SourceContext {
    kind: SourceKind,
    sink: BlockSink,
    stop: Receiver<()>,
    status: StatusSink,
    block_limit: Option<u64>,
    produced: Arc<AtomicU64>,
}

impl SourceContext {
    /// Build a context; the source stops when every `stop` sender is dropped
    pub fn new(
        kind: SourceKind,
        sink: BlockSink,
        stop: Receiver<()>,
        status: StatusSink,
        block_limit: Option<u64>,
    ) -> Self {
        Self {
            kind,
            sink,
            stop,
            status,
            block_limit,
            produced: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether stop has been requested
    pub fn stop_requested(&self) -> bool {
        !matches!(self.stop.try_recv(), Err(TryRecvError::Empty))
    }

    /// Sleep up to `timeout`; returns false if stop was requested meanwhile
    pub fn wait(&self, timeout: Duration) -> bool {
        matches!(self.stop.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    /// Whether the configured block limit has been reached
    pub fn limit_reached(&self) -> bool {
        self.block_limit
            .is_some_and(|limit| self.produced.load(Ordering::Relaxed) >= limit)
    }

    /// Stamp and queue a block; returns false when the source should exit
    pub fn emit(&mut self, samples: Vec<i16>, fs_hz: f64) -> bool {
        let sequence = self.produced.load(Ordering::Relaxed);
        let block = Block {
            samples,
            fs_hz,
            captured_at: Utc::now(),
            sequence,
        };
        match self.sink.send(block, &self.stop, &self.status) {
            Delivery::Queued => {
                self.produced.fetch_add(1, Ordering::Relaxed);
                true
            }
            Delivery::Stopped => false,
            Delivery::Disconnected => {
                self.status.emit(StatusEvent::SourceFailed {
                    kind: self.kind,
                    reason: "analyzer is no longer consuming blocks".into(),
                });
                false
            }
        }
    }

    /// Publish a status notification
    pub fn status(&self, event: StatusEvent) {
        self.status.emit(event);
    }

    /// Source kind this context belongs to
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Blocks queued so far
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    fn produced_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.produced)
    }
}

/// Software source pacing the synthetic generator at a fixed period
pub struct SyntheticSource {
    generator: SyntheticGenerator,
    period: Duration,
}

impl SyntheticSource {
    /// Create from a validated config
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            generator: SyntheticGenerator::new(config.fs_hz, config.n_samples, &config.synthetic),
            period: config.period(),
        }
    }

    fn run(&mut self, ctx: &mut SourceContext) {
        let fs_hz = self.generator.fs_hz();
        loop {
            let block = self.generator.next_block();
            tracing::trace!(injection = ?block.injection, "Synthetic block");
            if !ctx.emit(block.samples, fs_hz) || ctx.limit_reached() {
                break;
            }
            if !ctx.wait(self.period) {
                break;
            }
        }
    }
}

/// Closed set of waveform sources
pub enum WaveformSource {
    Synthetic(SyntheticSource),
    Scope(ScopeSource),
}

impl WaveformSource {
    /// Kind of this source
    pub fn kind(&self) -> SourceKind {
        match self {
            WaveformSource::Synthetic(_) => SourceKind::Synthetic,
            WaveformSource::Scope(scope) => scope.kind(),
        }
    }

    /// Achieved sample rate
    pub fn fs_hz(&self) -> f64 {
        match self {
            WaveformSource::Synthetic(s) => s.generator.fs_hz(),
            WaveformSource::Scope(scope) => scope.fs_hz(),
        }
    }

    /// Samples per block
    pub fn n_samples(&self) -> usize {
        match self {
            WaveformSource::Synthetic(s) => s.generator.n_samples(),
            WaveformSource::Scope(scope) => scope.n_samples(),
        }
    }

    /// Move the source onto its own thread and start producing
    pub fn spawn(self, ctx: SourceContext) -> std::io::Result<SourceHandle> {
        let mut handle = self.spawn_paused(ctx)?;
        handle.release();
        Ok(handle)
    }

    /// Move the source onto its own thread, holding it until
    /// [`SourceHandle::release`]
    ///
    /// A handle dropped without being released lets the thread exit
    /// without producing, which still tears the source down.
    pub fn spawn_paused(self, ctx: SourceContext) -> std::io::Result<SourceHandle> {
        let kind = self.kind();
        let produced = ctx.produced_counter();
        let (done_tx, done_rx) = bounded::<()>(0);
        let (go_tx, go_rx) = bounded::<()>(1);

        let thread = std::thread::Builder::new()
            .name("cdms-source".into())
            .spawn(move || {
                // Dropped last, including on unwind, which wakes `join_timeout`
                let _done = done_tx;
                let mut ctx = ctx;
                let mut source = self;

                if go_rx.recv().is_err() {
                    tracing::debug!(kind = %kind, "Source never released");
                    return;
                }

                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    match &mut source {
                        WaveformSource::Synthetic(s) => {
                            s.run(&mut ctx);
                            Ok(())
                        }
                        WaveformSource::Scope(s) => s.run(&mut ctx),
                    }
                }));

                match outcome {
                    Ok(Ok(())) => {
                        if ctx.limit_reached() {
                            ctx.status(StatusEvent::SourceExhausted {
                                kind,
                                blocks: ctx.produced(),
                            });
                        }
                    }
                    Ok(Err(e)) => ctx.status(StatusEvent::SourceFailed {
                        kind,
                        reason: e.to_string(),
                    }),
                    Err(_) => ctx.status(StatusEvent::SourceFailed {
                        kind,
                        reason: "source thread panicked".into(),
                    }),
                }

                tracing::debug!(
                    blocks = ctx.produced(),
                    dropped = ctx.sink.dropped(),
                    "Source thread exiting"
                );
            })?;

        Ok(SourceHandle {
            kind,
            thread: Some(thread),
            done: done_rx,
            go: Some(go_tx),
            produced,
        })
    }
}

/// Owner's view of a running source thread
pub struct SourceHandle {
    kind: SourceKind,
    thread: Option<JoinHandle<()>>,
    done: Receiver<()>,
    go: Option<Sender<()>>,
    produced: Arc<AtomicU64>,
}

impl SourceHandle {
    /// Let a paused source start producing; later calls do nothing
    pub fn release(&mut self) {
        if let Some(go) = self.go.take() {
            let _ = go.send(());
        }
    }

    /// Wait up to `timeout` for the thread to exit
    ///
    /// Returns false if it is still running; the thread is then detached.
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        // An unreleased source exits as soon as its gate closes
        self.go.take();
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(kind = %self.kind, "Source thread did not exit in time");
                self.thread.take();
                false
            }
            _ => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                true
            }
        }
    }

    /// Whether the thread has exited on its own
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Blocks queued so far
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    /// Kind of the running source
    pub fn kind(&self) -> SourceKind {
        self.kind
    }
}
